//! [`MemoryDaemon`] – periodic memory extraction.
//!
//! The daemon owns one background task.  Every tick it:
//!
//! 1. retries queued remote writes of the store,
//! 2. asks the [`ActivitySource`] for sessions not mined yet,
//! 3. runs the [`MemoryExtractor`] on each session under a timeout,
//! 4. stores the extracted memories, tagged with their session and skipping
//!    any the session already stored,
//! 5. marks the session processed and emits
//!    [`DaemonEvent::MemoriesExtracted`].
//!
//! Failures never escape the task; they are emitted as
//! [`DaemonEvent::Error`] through the [`EventHub`].
//!
//! [`MemoryDaemon::start`] and [`MemoryDaemon::stop`] are idempotent.  `stop`
//! waits for an in-flight cycle to finish, so no extraction starts after it
//! returns.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mnemo_store::{MemoryFilter, MemoryStore};
use mnemo_types::{DaemonEvent, Memory, MemoryType, MnemoError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::capability::{ActivitySource, MemoryExtractor, SessionActivity};
use crate::events::EventHub;
use crate::recall::RecallEngine;

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub interval: Duration,
    pub extraction_timeout: Duration,
    pub workspace_id: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            extraction_timeout: Duration::from_secs(60),
            workspace_id: "default".to_string(),
        }
    }
}

/// Summary of one extraction cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sessions: usize,
    pub memories: usize,
    pub failures: usize,
    pub flushed: usize,
}

struct Shared {
    config: DaemonConfig,
    store: Arc<MemoryStore>,
    source: Arc<dyn ActivitySource>,
    extractor: Arc<dyn MemoryExtractor>,
    events: EventHub,
    recall: OnceLock<Arc<RecallEngine>>,
    /// Held for the whole of a cycle so ticks and manual runs never overlap.
    cycle: Mutex<()>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct MemoryDaemon {
    shared: Arc<Shared>,
    state: Mutex<Option<Running>>,
}

impl MemoryDaemon {
    pub fn new(
        config: DaemonConfig,
        store: Arc<MemoryStore>,
        source: Arc<dyn ActivitySource>,
        extractor: Arc<dyn MemoryExtractor>,
        events: EventHub,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                source,
                extractor,
                events,
                recall: OnceLock::new(),
                cycle: Mutex::new(()),
            }),
            state: Mutex::new(None),
        }
    }

    /// Invalidate `recall`'s cache whenever a cycle stores new memories.
    ///
    /// Takes effect on a running daemon too.  Only the first engine is kept;
    /// a later one is logged and ignored.
    pub fn with_recall_engine(self, recall: Arc<RecallEngine>) -> Self {
        if self.shared.recall.set(recall).is_err() {
            warn!("memory daemon already has a recall engine; ignoring the new one");
        }
        self
    }

    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.shared.config
    }

    /// Spawn the periodic task.  Returns `false` when it is already running.
    ///
    /// The first cycle starts immediately.
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("memory daemon already running");
            return false;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        run_cycle(&shared).await;
                    }
                }
            }
            debug!("memory daemon loop exited");
        });

        *state = Some(Running { shutdown, handle });
        info!(
            workspace = %self.shared.config.workspace_id,
            interval_secs = self.shared.config.interval.as_secs(),
            "memory daemon started"
        );
        true
    }

    /// Stop the periodic task, waiting for an in-flight cycle.  Returns
    /// `false` when it was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.state.lock().await.take() else {
            return false;
        };
        // The receiver may already be gone if the task ended on its own.
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            error!(error = %e, "memory daemon task ended abnormally");
        }
        info!("memory daemon stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run a single cycle now, independent of the timer.
    pub async fn run_once(&self) -> CycleReport {
        run_cycle(&self.shared).await
    }
}

#[instrument(skip(shared), fields(workspace = %shared.config.workspace_id))]
async fn run_cycle(shared: &Shared) -> CycleReport {
    let _cycle = shared.cycle.lock().await;
    let mut report = CycleReport {
        flushed: shared.store.flush_remote().await,
        ..CycleReport::default()
    };

    let sessions = match shared.source.pending_sessions(&shared.config.workspace_id).await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "could not list pending sessions");
            shared.events.emit(DaemonEvent::Error(e.to_string()));
            report.failures += 1;
            return report;
        }
    };

    for session in sessions {
        report.sessions += 1;
        match extract_session(shared, &session).await {
            Ok(stored) => report.memories += stored,
            Err(e) => {
                warn!(session = %session.session_id, error = %e, "session extraction failed");
                shared.events.emit(DaemonEvent::Error(e.to_string()));
                report.failures += 1;
            }
        }
    }

    if report.memories > 0 {
        if let Some(recall) = shared.recall.get() {
            recall.invalidate_cache();
        }
    }
    debug!(?report, "daemon cycle complete");
    report
}

/// Tag carried by every memory extracted from `session_id`.
pub fn session_tag(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Extract, store and acknowledge one session.  Returns the number of
/// memories stored.
///
/// Inserts are idempotent per session: memories already stored under the
/// session's tag with the same type and content are skipped.  The session is
/// marked processed before [`DaemonEvent::MemoriesExtracted`] is emitted, so
/// a failed acknowledgement emits only an error and the retry next cycle
/// stores nothing twice.
async fn extract_session(shared: &Shared, session: &SessionActivity) -> Result<usize, MnemoError> {
    let timeout = shared.config.extraction_timeout;
    let memories = match tokio::time::timeout(timeout, shared.extractor.extract(session)).await {
        Ok(Ok(memories)) => memories,
        Ok(Err(e)) => return Err(MnemoError::DaemonExtractionFailure(e.to_string())),
        Err(_) => {
            return Err(MnemoError::Timeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ));
        }
    };

    let tag = session_tag(&session.session_id);
    let mut seen: HashSet<(MemoryType, String)> = shared
        .store
        .query(&MemoryFilter::workspace(&session.workspace_id).tags_any(std::slice::from_ref(&tag)))?
        .into_iter()
        .map(|m| (m.memory_type, m.content))
        .collect();

    let mut stored = 0;
    for memory in memories {
        if !seen.insert((memory.memory_type, memory.content.clone())) {
            debug!(session = %session.session_id, "memory already stored for this session");
            continue;
        }
        let mut memory = Memory {
            workspace_id: session.workspace_id.clone(),
            ..memory
        };
        if !memory.tags.contains(&tag) {
            memory.tags.push(tag.clone());
        }
        match shared.store.insert(memory).await {
            Ok(_) => stored += 1,
            Err(e) => {
                let err = MnemoError::from(e);
                warn!(session = %session.session_id, error = %err, "extracted memory rejected");
                shared.events.emit(DaemonEvent::Error(err.to_string()));
            }
        }
    }

    shared.source.mark_processed(&session.session_id).await?;
    shared.events.emit(DaemonEvent::MemoriesExtracted {
        count: stored,
        session_id: session.session_id.clone(),
    });
    info!(session = %session.session_id, count = stored, "memories extracted");
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::recall::{RecallConfig, RecallOptions};
    use async_trait::async_trait;
    use mnemo_types::MemoryType;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct QueueSource {
        pending: StdMutex<Vec<SessionActivity>>,
        processed: StdMutex<Vec<String>>,
        /// Number of upcoming `mark_processed` calls that fail.
        failing_marks: AtomicUsize,
    }

    impl QueueSource {
        fn with_sessions(ids: &[&str]) -> Self {
            let source = Self::default();
            *source.pending.lock().unwrap() = ids
                .iter()
                .map(|id| SessionActivity {
                    session_id: id.to_string(),
                    workspace_id: "ws".into(),
                    transcript: format!("transcript of {id}"),
                })
                .collect();
            source
        }
    }

    #[async_trait]
    impl ActivitySource for QueueSource {
        async fn pending_sessions(&self, _workspace_id: &str) -> Result<Vec<SessionActivity>, MnemoError> {
            Ok(self.pending.lock().unwrap().clone())
        }

        async fn mark_processed(&self, session_id: &str) -> Result<(), MnemoError> {
            if self
                .failing_marks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MnemoError::DaemonExtractionFailure("ledger is read-only".into()));
            }
            self.pending.lock().unwrap().retain(|s| s.session_id != session_id);
            self.processed.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    /// Returns two lessons per session, or fails / stalls on demand.
    #[derive(Default)]
    struct FakeExtractor {
        calls: AtomicUsize,
        fail: bool,
        stall: Option<Duration>,
    }

    #[async_trait]
    impl MemoryExtractor for FakeExtractor {
        async fn extract(&self, activity: &SessionActivity) -> Result<Vec<Memory>, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self.fail {
                return Err(LlmError::BadResponse("garbled".into()));
            }
            Ok(vec![
                Memory::new("wrong-ws", MemoryType::Lesson, format!("{} lesson one", activity.session_id), "one"),
                Memory::new("wrong-ws", MemoryType::Lesson, format!("{} lesson two", activity.session_id), "two"),
            ])
        }
    }

    fn config(interval_ms: u64) -> DaemonConfig {
        DaemonConfig {
            interval: Duration::from_millis(interval_ms),
            extraction_timeout: Duration::from_millis(200),
            workspace_id: "ws".into(),
        }
    }

    fn daemon(source: Arc<QueueSource>, extractor: Arc<FakeExtractor>, interval_ms: u64) -> (MemoryDaemon, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        let daemon = MemoryDaemon::new(
            config(interval_ms),
            Arc::clone(&store),
            source,
            extractor,
            EventHub::default(),
        );
        (daemon, store)
    }

    #[tokio::test]
    async fn cycle_stores_memories_and_emits_event() {
        let source = Arc::new(QueueSource::with_sessions(&["s1"]));
        let (daemon, store) = daemon(Arc::clone(&source), Arc::new(FakeExtractor::default()), 60_000);
        let mut rx = daemon.events().subscribe();

        let report = daemon.run_once().await;
        assert_eq!(report.sessions, 1);
        assert_eq!(report.memories, 2);
        assert_eq!(store.local().count("ws").unwrap(), 2);
        assert_eq!(store.local().count("wrong-ws").unwrap(), 0);
        assert_eq!(
            rx.recv().await.unwrap(),
            DaemonEvent::MemoriesExtracted {
                count: 2,
                session_id: "s1".into()
            }
        );
        assert_eq!(*source.processed.lock().unwrap(), vec!["s1".to_string()]);

        // Processed sessions are not mined twice.
        assert_eq!(daemon.run_once().await.sessions, 0);
    }

    #[tokio::test]
    async fn extracted_memories_carry_their_session_tag() {
        let source = Arc::new(QueueSource::with_sessions(&["s1"]));
        let (daemon, store) = daemon(source, Arc::new(FakeExtractor::default()), 60_000);

        daemon.run_once().await;
        let tagged = store
            .query(&MemoryFilter::workspace("ws").tags_any(&[session_tag("s1")]))
            .unwrap();
        assert_eq!(tagged.len(), 2);
    }

    #[tokio::test]
    async fn failed_acknowledgement_does_not_duplicate_memories() {
        let source = Arc::new(QueueSource::with_sessions(&["s1"]));
        source.failing_marks.store(1, Ordering::SeqCst);
        let extractor = Arc::new(FakeExtractor::default());
        let (daemon, store) = daemon(Arc::clone(&source), Arc::clone(&extractor), 60_000);
        let mut rx = daemon.events().subscribe();

        let first = daemon.run_once().await;
        assert_eq!(first.failures, 1);
        assert_eq!(store.local().count("ws").unwrap(), 2);
        match rx.recv().await.unwrap() {
            DaemonEvent::Error(msg) => assert!(msg.contains("read-only")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(source.pending.lock().unwrap().len(), 1);

        let second = daemon.run_once().await;
        assert_eq!(second.failures, 0);
        assert_eq!(second.memories, 0);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.local().count("ws").unwrap(), 2);
        assert_eq!(
            rx.recv().await.unwrap(),
            DaemonEvent::MemoriesExtracted {
                count: 0,
                session_id: "s1".into()
            }
        );
        assert_eq!(*source.processed.lock().unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn extraction_failure_is_an_event_and_keeps_session_pending() {
        let source = Arc::new(QueueSource::with_sessions(&["s1"]));
        let extractor = Arc::new(FakeExtractor {
            fail: true,
            ..FakeExtractor::default()
        });
        let (daemon, _store) = daemon(Arc::clone(&source), extractor, 60_000);
        let mut rx = daemon.events().subscribe();

        let report = daemon.run_once().await;
        assert_eq!(report.failures, 1);
        match rx.recv().await.unwrap() {
            DaemonEvent::Error(msg) => assert!(msg.contains("garbled")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(source.pending.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_extraction_times_out() {
        let source = Arc::new(QueueSource::with_sessions(&["s1"]));
        let extractor = Arc::new(FakeExtractor {
            stall: Some(Duration::from_secs(5)),
            ..FakeExtractor::default()
        });
        let (daemon, _store) = daemon(source, extractor, 60_000);
        let mut rx = daemon.events().subscribe();

        daemon.run_once().await;
        match rx.recv().await.unwrap() {
            DaemonEvent::Error(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let source = Arc::new(QueueSource::with_sessions(&[]));
        let (daemon, _store) = daemon(source, Arc::new(FakeExtractor::default()), 60_000);

        assert!(daemon.start().await);
        assert!(!daemon.start().await);
        assert!(daemon.is_running().await);

        assert!(daemon.stop().await);
        assert!(!daemon.stop().await);
        assert!(!daemon.is_running().await);

        // A stopped daemon can be started again.
        assert!(daemon.start().await);
        assert!(daemon.stop().await);
    }

    #[tokio::test]
    async fn no_extraction_begins_after_stop() {
        let source = Arc::new(QueueSource::with_sessions(&["s1", "s2"]));
        // Keep the sessions pending so every tick extracts again.
        let extractor = Arc::new(FakeExtractor {
            fail: true,
            ..FakeExtractor::default()
        });
        let (daemon, _store) = daemon(source, Arc::clone(&extractor), 5);

        daemon.start().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        daemon.stop().await;

        let after_stop = extractor.calls.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn callback_listeners_see_daemon_events() {
        let source = Arc::new(QueueSource::with_sessions(&["s1"]));
        let (daemon, _store) = daemon(source, Arc::new(FakeExtractor::default()), 60_000);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let subscription = daemon.events().on(move |event| {
            if let DaemonEvent::MemoriesExtracted { count, .. } = event {
                counter.fetch_add(*count, Ordering::SeqCst);
            }
        });

        daemon.run_once().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        subscription.off();
    }

    #[tokio::test]
    async fn new_memories_invalidate_the_recall_cache() {
        let source = Arc::new(QueueSource::with_sessions(&["s1"]));
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        let engine = Arc::new(RecallEngine::new(Arc::clone(&store), RecallConfig::default()));
        let daemon = MemoryDaemon::new(
            config(60_000),
            store,
            source,
            Arc::new(FakeExtractor::default()),
            EventHub::default(),
        )
        .with_recall_engine(Arc::clone(&engine));

        let before = engine.recall("lesson", "ws", &RecallOptions::default()).await;
        assert!(before.memories.is_empty());
        assert_eq!(engine.cache_len(), 1);

        daemon.run_once().await;
        assert_eq!(engine.cache_len(), 0);
        let after = engine.recall("lesson", "ws", &RecallOptions::default()).await;
        assert!(!after.used_cache);
        assert_eq!(after.memories.len(), 2);
    }

    #[tokio::test]
    async fn recall_engine_attaches_to_a_running_daemon() {
        let source = Arc::new(QueueSource::with_sessions(&["s1"]));
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        let engine = Arc::new(RecallEngine::new(Arc::clone(&store), RecallConfig::default()));
        let daemon = MemoryDaemon::new(
            config(60_000),
            store,
            Arc::clone(&source) as Arc<dyn ActivitySource>,
            Arc::new(FakeExtractor::default()),
            EventHub::default(),
        );
        // Hold the pending session back until the engine is attached.
        let held = std::mem::take(&mut *source.pending.lock().unwrap());
        daemon.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let daemon = daemon.with_recall_engine(Arc::clone(&engine));

        engine.recall("lesson", "ws", &RecallOptions::default()).await;
        assert_eq!(engine.cache_len(), 1);
        *source.pending.lock().unwrap() = held;
        daemon.run_once().await;
        assert_eq!(engine.cache_len(), 0);
        daemon.stop().await;
    }
}
