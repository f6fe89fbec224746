//! Stale memory reinforcement.
//!
//! Every protection level mandates a maximum gap between two recalls:
//!
//! | level | label       | interval |
//! |-------|-------------|----------|
//! | 0     | `IMMUTABLE` | 3 days   |
//! | 1     | `PROTECTED` | 7 days   |
//! | 2     | `STANDARD`  | 30 days  |
//! | 3     | `EPHEMERAL` | 90 days  |
//!
//! A memory is stale when it was never recalled or its last recall is at
//! least one interval old.  The [`StaleMemoryInjector`] selects stale
//! memories for forced reinjection, but selecting a memory never counts as
//! recalling it: only [`StaleMemoryInjector::mark_as_recalled`] advances
//! `last_recalled_at`.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mnemo_store::{MemoryFilter, MemoryStore};
use mnemo_types::{Memory, MnemoError, ProtectionLevel};
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::recall::format_entry;

/// A memory overdue for reinforcement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleMemory {
    pub memory: Memory,
    /// Whole days since the last recall; `None` when never recalled.
    pub days_since_recall: Option<i64>,
    pub interval_days: i64,
}

impl StaleMemory {
    /// Sort key for "how overdue": never recalled ranks above any age.
    fn overdue_rank(&self) -> i64 {
        self.days_since_recall.unwrap_or(i64::MAX)
    }
}

pub struct StaleMemoryInjector {
    store: Arc<MemoryStore>,
}

impl StaleMemoryInjector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn get_stale_memories(&self, workspace_id: &str, max_results: usize) -> Result<Vec<StaleMemory>, MnemoError> {
        self.get_stale_memories_at(workspace_id, max_results, Utc::now())
    }

    /// Stale memories of `workspace_id` as of `now`, most critical first:
    /// protection level ascending, then financial impact descending, then
    /// days since recall descending.
    #[instrument(skip(self), fields(workspace = %workspace_id))]
    pub fn get_stale_memories_at(
        &self,
        workspace_id: &str,
        max_results: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<StaleMemory>, MnemoError> {
        let mut stale = Vec::new();
        for level in ProtectionLevel::ALL {
            let interval = level.recall_interval();
            let filter = MemoryFilter::workspace(workspace_id)
                .protection_level(level)
                .stale_as_of(now - interval);
            for memory in self.store.query(&filter)? {
                let days_since_recall = memory.last_recalled_at.map(|at| (now - at).num_days());
                stale.push(StaleMemory {
                    memory,
                    days_since_recall,
                    interval_days: interval.num_days(),
                });
            }
        }

        stale.sort_by(compare_stale);
        stale.truncate(max_results);
        debug!(count = stale.len(), "stale memories selected");
        Ok(stale)
    }

    /// Acknowledge that `ids` were surfaced to the consumer.  Monotonic and
    /// idempotent; returns the number of memories whose timestamp advanced.
    pub async fn mark_as_recalled(&self, ids: &[Uuid]) -> Result<usize, MnemoError> {
        self.mark_as_recalled_at(ids, Utc::now()).await
    }

    pub async fn mark_as_recalled_at(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize, MnemoError> {
        Ok(self.store.update_last_recalled(ids, at).await?)
    }
}

fn compare_stale(a: &StaleMemory, b: &StaleMemory) -> Ordering {
    a.memory
        .protection_level
        .cmp(&b.memory.protection_level)
        .then_with(|| {
            let ia = a.memory.financial_impact.unwrap_or(0.0);
            let ib = b.memory.financial_impact.unwrap_or(0.0);
            ib.total_cmp(&ia)
        })
        .then_with(|| b.overdue_rank().cmp(&a.overdue_rank()))
}

/// Render a "requires reinforcement" block.  Returns an empty string for an
/// empty list.
pub fn format_for_injection(stale: &[StaleMemory]) -> String {
    if stale.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Memories requiring reinforcement\n");
    for (i, s) in stale.iter().enumerate() {
        format_entry(&mut out, i + 1, &s.memory);
        let since = match s.days_since_recall {
            Some(days) => format!("{days} days ago"),
            None => "NEVER".to_string(),
        };
        out.push_str(&format!(
            "   last recalled: {since} (interval {} days)\n",
            s.interval_days
        ));
    }
    out
}
