//! Per-turn context assembly.
//!
//! One user turn gathers memories from all three sources, renders them into
//! a single block and acknowledges exactly the memories that were shown:
//!
//! ```text
//!  message ──► TriggerRecall ──┐
//!          ──► MemoryRecall  ──┼──► de-duplicate ──► text block ──► mark_as_recalled
//!  (opt.)  ──► StaleInjector ──┘
//! ```
//!
//! A failing source contributes nothing; the turn proceeds with whatever the
//! others returned.

use std::collections::HashSet;
use std::sync::Arc;

use mnemo_types::MnemoError;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::recall::{MemoryRecall, RecallOptions, format_for_prompt};
use crate::stale::{StaleMemoryInjector, format_for_injection};
use crate::trigger::{TriggerRecall, format_triggered_memories};

/// The assembled context of one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InjectedContext {
    pub text: String,
    /// Every memory rendered into `text`, in display order.
    pub surfaced_ids: Vec<Uuid>,
    /// Memories whose `last_recalled_at` advanced.
    pub acknowledged: usize,
    /// Errors absorbed while assembling.
    pub errors: Vec<MnemoError>,
}

pub struct ContextAssembler {
    triggers: TriggerRecall,
    recall: Arc<dyn MemoryRecall>,
    injector: StaleMemoryInjector,
    recall_options: RecallOptions,
    stale_limit: Option<usize>,
}

impl ContextAssembler {
    pub fn new(triggers: TriggerRecall, recall: Arc<dyn MemoryRecall>, injector: StaleMemoryInjector) -> Self {
        Self {
            triggers,
            recall,
            injector,
            recall_options: RecallOptions::default(),
            stale_limit: None,
        }
    }

    pub fn with_recall_options(mut self, options: RecallOptions) -> Self {
        self.recall_options = options;
        self
    }

    /// Also force up to `max` stale memories into every turn.
    pub fn with_stale_injection(mut self, max: usize) -> Self {
        self.stale_limit = Some(max);
        self
    }

    pub async fn build(&self, message: &str, workspace_id: &str) -> InjectedContext {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut surfaced_ids = Vec::new();
        let mut errors = Vec::new();
        let mut blocks = Vec::new();

        let triggered: Vec<_> = self
            .triggers
            .check_triggers(message, workspace_id)
            .await
            .into_iter()
            .filter(|t| seen.insert(t.memory.id))
            .collect();
        surfaced_ids.extend(triggered.iter().map(|t| t.memory.id));
        blocks.push(format_triggered_memories(&triggered));

        let result = self.recall.recall(message, workspace_id, &self.recall_options).await;
        if let Some(e) = result.error {
            errors.push(e);
        }
        let recalled: Vec<_> = result
            .memories
            .into_iter()
            .filter(|m| seen.insert(m.id))
            .collect();
        surfaced_ids.extend(recalled.iter().map(|m| m.id));
        blocks.push(format_for_prompt(&recalled));

        if let Some(max) = self.stale_limit {
            match self.injector.get_stale_memories(workspace_id, max) {
                Ok(stale) => {
                    let stale: Vec<_> = stale.into_iter().filter(|s| seen.insert(s.memory.id)).collect();
                    surfaced_ids.extend(stale.iter().map(|s| s.memory.id));
                    blocks.push(format_for_injection(&stale));
                }
                Err(e) => {
                    warn!(error = %e, "stale memory selection failed");
                    errors.push(e);
                }
            }
        }

        let acknowledged = match self.injector.mark_as_recalled(&surfaced_ids).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "could not acknowledge surfaced memories");
                errors.push(e);
                0
            }
        };

        let text = blocks
            .into_iter()
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        debug!(surfaced = surfaced_ids.len(), acknowledged, "context assembled");
        InjectedContext {
            text,
            surfaced_ids,
            acknowledged,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall::{RecallConfig, RecallEngine};
    use mnemo_store::MemoryStore;
    use mnemo_types::{Memory, MemoryType, ProtectionLevel, TriggerRule};

    async fn setup() -> (Arc<MemoryStore>, ContextAssembler) {
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        store
            .insert(Memory::new("ws", MemoryType::Lesson, "Drawdown over 8% means flatten", "flatten at 8% drawdown").with_importance(0.9))
            .await
            .unwrap();
        store
            .insert(
                Memory::new("ws", MemoryType::Rule, "Never trade the open", "skip the open")
                    .with_protection(ProtectionLevel::Immutable),
            )
            .await
            .unwrap();
        let engine: Arc<dyn MemoryRecall> = Arc::new(RecallEngine::new(Arc::clone(&store), RecallConfig::default()));
        let triggers = TriggerRecall::new(
            vec![TriggerRule::new("risk", ["drawdown"], "drawdown").with_min_importance(0.8)],
            Arc::clone(&engine),
        );
        let assembler = ContextAssembler::new(triggers, engine, StaleMemoryInjector::new(Arc::clone(&store)))
            .with_recall_options(RecallOptions::default().with_min_importance(0.8));
        (store, assembler)
    }

    #[tokio::test]
    async fn surfaced_memories_appear_once_and_are_acknowledged() {
        let (store, assembler) = setup().await;

        let ctx = assembler.build("my drawdown is growing", "ws").await;
        assert!(ctx.errors.is_empty());
        assert_eq!(ctx.surfaced_ids.len(), 1);
        assert_eq!(ctx.acknowledged, 1);
        assert!(ctx.text.contains("AUTO-SURFACED"));
        // Recalled too, but already shown by the trigger.
        assert!(!ctx.text.contains("Relevant memories"));

        let shown = store.get(ctx.surfaced_ids[0]).unwrap().unwrap();
        assert!(shown.last_recalled_at.is_some());
    }

    #[tokio::test]
    async fn stale_injection_adds_reinforcement_block() {
        let (_store, assembler) = setup().await;
        let assembler = assembler.with_stale_injection(5);

        let ctx = assembler.build("anything new today?", "ws").await;
        assert!(ctx.text.contains("requiring reinforcement"));
        assert!(ctx.text.contains("skip the open"));
        assert_eq!(ctx.acknowledged, ctx.surfaced_ids.len());

        // Acknowledged memories are no longer stale on the next turn.
        let again = assembler.build("anything new today?", "ws").await;
        assert!(!again.text.contains("skip the open"));
    }

    #[tokio::test]
    async fn nothing_to_say_yields_empty_text() {
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        let engine: Arc<dyn MemoryRecall> = Arc::new(RecallEngine::new(Arc::clone(&store), RecallConfig::default()));
        let assembler = ContextAssembler::new(
            TriggerRecall::new(Vec::new(), Arc::clone(&engine)),
            engine,
            StaleMemoryInjector::new(store),
        )
        .with_stale_injection(3);

        let ctx = assembler.build("hello", "ws").await;
        assert_eq!(ctx.text, "");
        assert_eq!(ctx.acknowledged, 0);
    }
}
