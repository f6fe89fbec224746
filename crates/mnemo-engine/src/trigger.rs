//! Keyword-triggered proactive recall.
//!
//! A [`TriggerRule`] maps a keyword family to a canned recall query.  When
//! any keyword of a rule occurs in a message (case-insensitive substring
//! match) the rule's query is issued against the recall engine and the
//! results are surfaced whether or not the user asked for them.

use std::collections::HashMap;
use std::sync::Arc;

use mnemo_types::{Memory, ProtectionLevel, TriggerRule};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::recall::{MemoryRecall, RecallOptions, format_entry};

/// A memory surfaced by one or more trigger rules.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggeredMemory {
    pub memory: Memory,
    /// Keywords that fired, merged across every rule that returned this memory.
    pub triggered_by: Vec<String>,
    /// Name of the first rule that returned this memory.
    pub rule_name: String,
}

pub struct TriggerRecall {
    rules: Vec<TriggerRule>,
    recall: Arc<dyn MemoryRecall>,
}

impl TriggerRecall {
    pub fn new(rules: Vec<TriggerRule>, recall: Arc<dyn MemoryRecall>) -> Self {
        Self { rules, recall }
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    /// Scan `message` and recall the memories of every rule that fires.
    ///
    /// Results are de-duplicated by memory id in rule order.  Recall errors
    /// are logged and contribute nothing.
    #[instrument(skip(self, message), fields(workspace = %workspace_id))]
    pub async fn check_triggers(&self, message: &str, workspace_id: &str) -> Vec<TriggeredMemory> {
        let lowered = message.to_lowercase();
        let mut surfaced: Vec<TriggeredMemory> = Vec::new();
        let mut index: HashMap<Uuid, usize> = HashMap::new();

        for rule in &self.rules {
            let keywords = rule.matched_keywords(&lowered);
            if keywords.is_empty() {
                continue;
            }
            debug!(rule = %rule.name, ?keywords, "trigger rule fired");

            let result = self
                .recall
                .recall(&rule.memory_query, workspace_id, &rule_options(rule))
                .await;
            if let Some(e) = result.error {
                warn!(rule = %rule.name, error = %e, "trigger recall failed");
                continue;
            }

            for memory in result.memories {
                match index.get(&memory.id) {
                    Some(&pos) => {
                        let existing = &mut surfaced[pos].triggered_by;
                        for k in &keywords {
                            if !existing.contains(k) {
                                existing.push(k.clone());
                            }
                        }
                    }
                    None => {
                        index.insert(memory.id, surfaced.len());
                        surfaced.push(TriggeredMemory {
                            memory,
                            triggered_by: keywords.clone(),
                            rule_name: rule.name.clone(),
                        });
                    }
                }
            }
        }
        surfaced
    }
}

/// Recall options for a fired rule.  The protection level filter is part of
/// the store query so the rule's limit applies to matching memories only.
fn rule_options(rule: &TriggerRule) -> RecallOptions {
    let mut options = RecallOptions::default()
        .with_limit(rule.limit)
        .with_min_importance(rule.min_importance);
    if let Some(level) = rule.protection_level_filter {
        options = options.with_protection_level(level);
    }
    options
}

/// Render an "auto-surfaced" block, visually distinct from relevance-ranked
/// recall.  Returns an empty string for an empty list.
pub fn format_triggered_memories(triggered: &[TriggeredMemory]) -> String {
    if triggered.is_empty() {
        return String::new();
    }
    let mut out = String::from("## AUTO-SURFACED memories (keyword triggers)\n");
    for (i, t) in triggered.iter().enumerate() {
        format_entry(&mut out, i + 1, &t.memory);
        out.push_str(&format!(
            "   triggered by: {} ({})\n",
            t.triggered_by.join(", "),
            t.rule_name
        ));
    }
    out
}

/// Built-in trigger rules for a trading workflow.
pub fn default_trigger_rules() -> Vec<TriggerRule> {
    vec![
        TriggerRule::new(
            "risk",
            ["drawdown", "stop loss", "stop-loss", "max loss", "risk"],
            "risk management lessons and stop loss discipline",
        )
        .with_min_importance(0.5),
        TriggerRule::new(
            "sizing",
            ["position size", "leverage", "margin", "allocation"],
            "position sizing and leverage lessons",
        )
        .with_min_importance(0.5),
        TriggerRule::new(
            "earnings",
            ["earnings", "guidance", "eps"],
            "earnings event lessons",
        ),
        TriggerRule::new(
            "volatility",
            ["volatility", "vix", "gap", "regime"],
            "volatility regime lessons",
        ),
        TriggerRule::new(
            "critical",
            ["live trading", "go live", "deploy", "kill switch"],
            "critical rules before trading live",
        )
        .with_protection_filter(ProtectionLevel::Immutable),
    ]
}
