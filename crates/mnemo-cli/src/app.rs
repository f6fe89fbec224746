//! Engine wiring and command execution.
//!
//! [`App`] owns one instance of every engine component, built from the
//! [`Config`].  [`App::execute`] runs a parsed [`Command`] and returns the
//! text to show; printing and prompting stay in the REPL.

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use mnemo_engine::{
    ContextAssembler, DaemonConfig, EventHub, LlmDriver, MemoryDaemon, MemoryRecall, PatternDetector, RecallConfig,
    RecallEngine, RecallOptions, StaleMemoryInjector, Subscription, TriggerRecall, format_for_injection,
    format_for_prompt, format_triggered_memories,
};
use mnemo_store::{LocalStore, MemoryStore, NoRemote, RemoteStore, RestRemote};
use mnemo_types::{DaemonEvent, Memory, Pattern, Rule};
use tracing::{debug, info};

use crate::commands::{Command, DaemonAction, RememberArgs};
use crate::config::Config;
use crate::sessions::DirectorySource;

pub struct App {
    config: Config,
    store: Arc<MemoryStore>,
    llm: Arc<LlmDriver>,
    recall: Arc<RecallEngine>,
    injector: StaleMemoryInjector,
    triggers: TriggerRecall,
    context: ContextAssembler,
    detector: PatternDetector,
    daemon: MemoryDaemon,
    _daemon_events: Subscription,
}

impl App {
    /// Open the stores named by `config` and assemble the engine.
    pub fn open(config: Config) -> Result<Self, String> {
        if let Some(parent) = std::path::Path::new(&config.db_path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
        let local = LocalStore::open(&config.db_path)
            .map_err(|e| format!("Failed to open memory database {}: {}", config.db_path, e))?;

        let remote: Arc<dyn RemoteStore> = if config.remote_url.trim().is_empty() {
            Arc::new(NoRemote)
        } else {
            let key = (!config.remote_api_key.is_empty()).then(|| config.remote_api_key.clone());
            Arc::new(RestRemote::new(config.remote_url.clone(), key))
        };
        Ok(Self::with_store(config, Arc::new(MemoryStore::new(local, remote))))
    }

    pub fn with_store(config: Config, store: Arc<MemoryStore>) -> Self {
        let llm = Arc::new(
            LlmDriver::new(config.llm_url.clone(), config.model.clone())
                .with_embedding_model(config.embedding_model.clone())
                .with_api_key(config.api_key.clone()),
        );
        let recall = Arc::new(
            RecallEngine::new(Arc::clone(&store), RecallConfig::default())
                .with_embedder(llm.clone())
                .with_reranker(llm.clone()),
        );
        let as_recall: Arc<dyn MemoryRecall> = recall.clone();

        let mut context = ContextAssembler::new(
            TriggerRecall::new(config.triggers.clone(), Arc::clone(&as_recall)),
            Arc::clone(&as_recall),
            StaleMemoryInjector::new(Arc::clone(&store)),
        );
        if config.stale_per_turn > 0 {
            context = context.with_stale_injection(config.stale_per_turn);
        }

        let events = EventHub::default();
        let daemon_events = events.on(report_daemon_event);
        let daemon = MemoryDaemon::new(
            DaemonConfig {
                interval: Duration::from_secs(config.daemon_interval_secs.max(1)),
                workspace_id: config.workspace_id.clone(),
                ..DaemonConfig::default()
            },
            Arc::clone(&store),
            Arc::new(DirectorySource::new(config.sessions_dir.clone())),
            llm.clone(),
            events,
        )
        .with_recall_engine(Arc::clone(&recall));

        Self {
            triggers: TriggerRecall::new(config.triggers.clone(), as_recall),
            injector: StaleMemoryInjector::new(Arc::clone(&store)),
            detector: PatternDetector::new(Arc::clone(&store)),
            context,
            daemon,
            _daemon_events: daemon_events,
            recall,
            llm,
            store,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn workspace(&self) -> &str {
        &self.config.workspace_id
    }

    /// Pre-populate the recall cache with the common queries.
    pub async fn warm_up(&self) -> usize {
        self.recall.warm_cache(self.workspace()).await
    }

    /// Stop the daemon if it runs.  Returns whether it was running.
    pub async fn shutdown(&self) -> bool {
        self.daemon.stop().await
    }

    /// Run `command`.  `Help`, `Settings` and `Quit` are handled by the
    /// REPL and produce no output here.
    pub async fn execute(&self, command: Command) -> Result<String, String> {
        match command {
            Command::Remember(args) => self.remember(args).await,
            Command::Recall {
                query,
                limit,
                rerank,
                fresh,
            } => {
                let mut options = RecallOptions::default();
                if let Some(limit) = limit {
                    options = options.with_limit(limit);
                }
                if rerank {
                    options = options.with_rerank();
                }
                if fresh {
                    options = options.without_cache();
                }
                let result = self.recall.recall(&query, self.workspace(), &options).await;
                if let Some(e) = result.error {
                    return Err(format!("recall failed: {e}"));
                }
                if result.memories.is_empty() {
                    return Ok("No matching memories.".to_string());
                }
                Ok(format!(
                    "{}{} of {} shown, {} ms{}",
                    format_for_prompt(&result.memories),
                    result.memories.len(),
                    result.total_found,
                    result.search_time_ms,
                    if result.used_cache { ", cached" } else { "" }
                ))
            }
            Command::Stale { max } => {
                let stale = self
                    .injector
                    .get_stale_memories(self.workspace(), max)
                    .map_err(|e| e.to_string())?;
                if stale.is_empty() {
                    return Ok("No memories are overdue for reinforcement.".to_string());
                }
                let ids: Vec<String> = stale.iter().map(|s| s.memory.id.to_string()).collect();
                Ok(format!("{}ids: {}", format_for_injection(&stale), ids.join(" ")))
            }
            Command::Ack { ids } => {
                let n = self.injector.mark_as_recalled(&ids).await.map_err(|e| e.to_string())?;
                Ok(format!("Acknowledged {n} of {} memories.", ids.len()))
            }
            Command::Trigger { message } => {
                let triggered = self.triggers.check_triggers(&message, self.workspace()).await;
                if triggered.is_empty() {
                    return Ok("No trigger rule fired.".to_string());
                }
                Ok(format_triggered_memories(&triggered))
            }
            Command::Context { message } => {
                let ctx = self.context.build(&message, self.workspace()).await;
                let mut out = if ctx.text.is_empty() {
                    "Nothing to inject for this turn.\n".to_string()
                } else {
                    ctx.text
                };
                out.push_str(&format!(
                    "surfaced {}, acknowledged {}",
                    ctx.surfaced_ids.len(),
                    ctx.acknowledged
                ));
                for e in ctx.errors {
                    out.push_str(&format!("\nwarning: {e}"));
                }
                Ok(out)
            }
            Command::Patterns => self.patterns().await,
            Command::Rules => {
                let rules = self.store.list_rules(self.workspace()).map_err(|e| e.to_string())?;
                if rules.is_empty() {
                    return Ok("No rules promoted yet.".to_string());
                }
                Ok(rules.iter().map(rule_line).collect::<Vec<_>>().join("\n"))
            }
            Command::Daemon(action) => Ok(self.daemon_command(action).await),
            Command::Flush => {
                let flushed = self.store.flush_remote().await;
                let mut out = format!(
                    "Flushed {flushed} queued remote write(s); {} still pending.",
                    self.store.pending_remote_writes()
                );
                let dropped = self.store.dropped_remote_writes();
                if dropped > 0 {
                    out.push_str(&format!(" {dropped} dropped while the retry queue was full."));
                }
                Ok(out)
            }
            Command::Help | Command::Settings | Command::Quit => Ok(String::new()),
        }
    }

    async fn remember(&self, args: RememberArgs) -> Result<String, String> {
        let mut memory = Memory::new(self.workspace(), args.memory_type, args.content, String::new()).with_tags(args.tags);
        if let Some(score) = args.importance {
            memory = memory.with_importance(score);
        }
        if let Some(level) = args.protection_level {
            memory = memory.with_protection(level);
        }
        if let Some(impact) = args.financial_impact {
            memory = memory.with_financial_impact(impact);
        }
        if let Some(category) = args.category {
            memory = memory.with_category(category);
        }
        match self.llm.embed_text(&memory.content).await {
            Ok(embedding) if !embedding.is_empty() => memory = memory.with_embedding(embedding),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "storing memory without embedding"),
        }

        let kind = memory.memory_type;
        let level = memory.protection_level;
        let id = self.store.insert(memory).await.map_err(|e| e.to_string())?;
        self.recall.invalidate_cache();
        info!(%id, %kind, "memory remembered");
        Ok(format!("Stored {kind} {id} ({level})."))
    }

    async fn patterns(&self) -> Result<String, String> {
        let ws = self.workspace();
        let mut patterns = self
            .detector
            .detect_repeated_lessons(ws)
            .await
            .map_err(|e| e.to_string())?;
        patterns.extend(self.detector.detect_failure_modes(ws).map_err(|e| e.to_string())?);
        patterns.extend(
            self.detector
                .detect_regime_profile_patterns(ws)
                .await
                .map_err(|e| e.to_string())?,
        );
        if patterns.is_empty() {
            return Ok("No patterns detected.".to_string());
        }
        Ok(patterns.iter().map(pattern_line).collect::<Vec<_>>().join("\n"))
    }

    async fn daemon_command(&self, action: DaemonAction) -> String {
        match action {
            DaemonAction::Start => {
                if self.daemon.start().await {
                    format!(
                        "Memory daemon started (every {} s, sessions in {}).",
                        self.daemon.config().interval.as_secs(),
                        self.config.sessions_dir
                    )
                } else {
                    "Memory daemon is already running.".to_string()
                }
            }
            DaemonAction::Stop => {
                if self.daemon.stop().await {
                    "Memory daemon stopped.".to_string()
                } else {
                    "Memory daemon is not running.".to_string()
                }
            }
            DaemonAction::Once => {
                let report = self.daemon.run_once().await;
                format!(
                    "Cycle: {} session(s), {} memories stored, {} failed, {} remote write(s) flushed.",
                    report.sessions, report.memories, report.failures, report.flushed
                )
            }
            DaemonAction::Status => format!(
                "Memory daemon {}; {} queued remote write(s); {} cached recall(s).",
                if self.daemon.is_running().await { "running" } else { "stopped" },
                self.store.pending_remote_writes(),
                self.recall.cache_len()
            ),
        }
    }
}

fn report_daemon_event(event: &DaemonEvent) {
    match event {
        DaemonEvent::MemoriesExtracted { count, session_id } if *count > 0 => {
            println!("\n  {} {} memories from session {}", "✓".green().bold(), count, session_id.bold());
        }
        DaemonEvent::MemoriesExtracted { .. } => {}
        DaemonEvent::Error(message) => {
            println!("\n  {} daemon: {}", "⚠".yellow().bold(), message);
        }
    }
}

fn pattern_line(p: &Pattern) -> String {
    format!(
        "• {} (confidence {:.2}, evidence {})",
        p.description, p.confidence, p.evidence_count
    )
}

fn rule_line(r: &Rule) -> String {
    format!(
        "• [{}] {} (confidence {:.2}, {} supporting, {})",
        r.rule_type,
        r.content,
        r.confidence,
        r.supporting_memory_ids.len(),
        if r.active { "active" } else { "inactive" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::parse;

    fn offline_config(sessions_dir: &std::path::Path) -> Config {
        Config {
            workspace_id: "ws".to_string(),
            llm_url: String::new(),
            sessions_dir: sessions_dir.to_string_lossy().into_owned(),
            stale_per_turn: 0,
            ..Config::default()
        }
    }

    fn app(dir: &tempfile::TempDir) -> App {
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        App::with_store(offline_config(dir.path()), store)
    }

    async fn run(app: &App, line: &str) -> Result<String, String> {
        app.execute(parse(line).unwrap().unwrap()).await
    }

    #[tokio::test]
    async fn remembered_memory_is_recalled() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        let stored = run(&app, "/remember lesson Trim leverage before earnings --importance 0.9").await.unwrap();
        assert!(stored.starts_with("Stored lesson"));

        let out = run(&app, "/recall leverage earnings").await.unwrap();
        assert!(out.contains("Trim leverage before earnings"));
        assert!(out.contains("1 of 1 shown"));
    }

    #[tokio::test]
    async fn repeated_lessons_become_rules() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        for _ in 0..3 {
            run(&app, "/remember lesson cut position size after two losing days --importance 0.8")
                .await
                .unwrap();
        }

        let patterns = run(&app, "/patterns").await.unwrap();
        assert!(patterns.contains("Repeated lesson (3 occurrences)"));

        let rules = run(&app, "/rules").await.unwrap();
        assert_eq!(rules.lines().count(), 1);
        assert!(rules.contains("cut position size after two losing days"));
    }

    #[tokio::test]
    async fn stale_then_ack_clears_the_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        run(&app, "/remember rule Never average down --level 0").await.unwrap();

        let stale = run(&app, "/stale").await.unwrap();
        let ids = stale.lines().last().unwrap().trim_start_matches("ids: ").to_string();
        let acked = run(&app, &format!("/ack {ids}")).await.unwrap();
        assert_eq!(acked, "Acknowledged 1 of 1 memories.");

        assert_eq!(run(&app, "/stale").await.unwrap(), "No memories are overdue for reinforcement.");
    }

    #[tokio::test]
    async fn triggers_follow_configured_rules() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        run(&app, "/remember lesson Respect the stop loss every time --importance 0.9").await.unwrap();

        assert_eq!(run(&app, "/trigger good morning").await.unwrap(), "No trigger rule fired.");
        let fired = run(&app, "/trigger nearly hit my stop loss").await.unwrap();
        assert!(fired.contains("AUTO-SURFACED"));
        assert!(fired.contains("Respect the stop loss"));
    }

    #[tokio::test]
    async fn daemon_once_reports_unconfigured_extraction() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("monday.txt"), "stopped out on the open again").unwrap();
        let app = app(&dir);

        let out = run(&app, "/daemon once").await.unwrap();
        assert!(out.starts_with("Cycle: 1 session(s), 0 memories stored, 1 failed"));
        assert!(run(&app, "/daemon").await.unwrap().starts_with("Memory daemon stopped"));
    }

    #[tokio::test]
    async fn daemon_start_stop_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        assert!(run(&app, "/daemon start").await.unwrap().starts_with("Memory daemon started"));
        assert_eq!(run(&app, "/daemon start").await.unwrap(), "Memory daemon is already running.");
        assert_eq!(run(&app, "/daemon stop").await.unwrap(), "Memory daemon stopped.");
        assert!(!app.shutdown().await);
    }

    #[tokio::test]
    async fn flush_without_remote_has_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        let out = run(&app, "/flush").await.unwrap();
        assert_eq!(out, "Flushed 0 queued remote write(s); 0 still pending.");
    }

    #[tokio::test]
    async fn open_creates_the_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: dir.path().join("nested").join("memory.db").to_string_lossy().into_owned(),
            ..offline_config(dir.path())
        };
        let app = App::open(config).unwrap();
        run(&app, "/remember fact The desk trades US equities only").await.unwrap();
        assert!(dir.path().join("nested").join("memory.db").exists());
    }
}
