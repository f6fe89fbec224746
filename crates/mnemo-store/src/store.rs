//! [`MemoryStore`] – write-through memory store.
//!
//! Every write lands in the [`LocalStore`] first and is then mirrored to the
//! [`RemoteStore`].  A remote failure never fails the call: the write is
//! pushed onto a FIFO retry queue and a warning is logged.  Reads are served
//! by the local leg so recall stays correct while offline.
//!
//! Call [`MemoryStore::flush_remote`] periodically (the memory daemon does so
//! on every cycle) to drain the queue.  The queue is bounded; once full, the
//! oldest queued write is dropped with a warning.  The local leg keeps every
//! dropped write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use mnemo_types::{Memory, Rule};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::filter::MemoryFilter;
use crate::local::LocalStore;
use crate::remote::{NoRemote, RemoteStore};

/// Queued remote writes kept by [`MemoryStore::new`].
pub const DEFAULT_RETRY_CAPACITY: usize = 10_000;

/// A remote write waiting to be retried.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Memory(Memory),
    LastRecalled { ids: Vec<Uuid>, at: DateTime<Utc> },
    Rule(Rule),
}

impl PendingWrite {
    fn kind(&self) -> &'static str {
        match self {
            PendingWrite::Memory(_) => "memory",
            PendingWrite::LastRecalled { .. } => "last_recalled",
            PendingWrite::Rule(_) => "rule",
        }
    }
}

/// Dual-leg memory store shared by the daemon and all recall components.
pub struct MemoryStore {
    local: LocalStore,
    remote: Arc<dyn RemoteStore>,
    pending: Mutex<VecDeque<PendingWrite>>,
    retry_capacity: usize,
    dropped: AtomicUsize,
}

impl MemoryStore {
    pub fn new(local: LocalStore, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            local,
            remote,
            pending: Mutex::new(VecDeque::new()),
            retry_capacity: DEFAULT_RETRY_CAPACITY,
            dropped: AtomicUsize::new(0),
        }
    }

    /// Bound the retry queue to `capacity` writes (at least one).
    pub fn with_retry_capacity(mut self, capacity: usize) -> Self {
        self.retry_capacity = capacity.max(1);
        self
    }

    /// A local-only store backed by an in-memory SQLite database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(LocalStore::open_in_memory()?, Arc::new(NoRemote)))
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// Store a new memory and return its id.
    ///
    /// The id and `created_at` are assigned here and `last_recalled_at` is
    /// reset, whatever the caller put in those fields.
    pub async fn insert(&self, memory: Memory) -> Result<Uuid, StoreError> {
        let memory = Memory {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            last_recalled_at: None,
            ..memory
        };
        self.local.insert(&memory)?;
        debug!(id = %memory.id, workspace = %memory.workspace_id, kind = %memory.memory_type, "memory stored locally");

        let id = memory.id;
        if let Err(e) = self.remote.insert_memory(&memory).await {
            self.enqueue(PendingWrite::Memory(memory), &e);
        }
        Ok(id)
    }

    pub fn query(&self, filter: &MemoryFilter) -> Result<Vec<Memory>, StoreError> {
        self.local.query(filter)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Memory>, StoreError> {
        self.local.get(id)
    }

    /// Monotonic bulk update of `last_recalled_at`.  Applying the same call
    /// twice leaves the same state.  Returns the number of local rows changed.
    pub async fn update_last_recalled(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let changed = self.local.update_last_recalled(ids, at)?;
        if let Err(e) = self.remote.update_last_recalled(ids, at).await {
            self.enqueue(
                PendingWrite::LastRecalled {
                    ids: ids.to_vec(),
                    at,
                },
                &e,
            );
        }
        Ok(changed)
    }

    pub fn list_rules(&self, workspace_id: &str) -> Result<Vec<Rule>, StoreError> {
        self.local.list_rules(workspace_id)
    }

    pub async fn insert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        self.local.insert_rule(rule)?;
        self.mirror_rule(rule).await;
        Ok(())
    }

    pub async fn update_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        self.local.update_rule(rule)?;
        self.mirror_rule(rule).await;
        Ok(())
    }

    async fn mirror_rule(&self, rule: &Rule) {
        if let Err(e) = self.remote.upsert_rule(rule).await {
            self.enqueue(PendingWrite::Rule(rule.clone()), &e);
        }
    }

    // -------------------------------------------------------------------------
    // Retry queue
    // -------------------------------------------------------------------------

    fn enqueue(&self, write: PendingWrite, err: &StoreError) {
        warn!(kind = write.kind(), error = %err, "remote write failed; queued for retry");
        let Ok(mut queue) = self.pending.lock() else {
            warn!(kind = write.kind(), "retry queue poisoned; remote write dropped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        while queue.len() >= self.retry_capacity {
            let Some(oldest) = queue.pop_front() else { break };
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                kind = oldest.kind(),
                capacity = self.retry_capacity,
                dropped,
                "retry queue full; oldest remote write dropped"
            );
        }
        queue.push_back(write);
    }

    /// Remote writes dropped because the retry queue was full.
    pub fn dropped_remote_writes(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of remote writes waiting for a retry.
    pub fn pending_remote_writes(&self) -> usize {
        self.pending.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Retry queued remote writes in FIFO order.
    ///
    /// Stops at the first failure, leaving that write (and everything behind
    /// it) queued.  Returns the number of writes delivered.
    pub async fn flush_remote(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = match self.pending.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            let Some(write) = next else { break };

            let result = match &write {
                PendingWrite::Memory(m) => self.remote.insert_memory(m).await,
                PendingWrite::LastRecalled { ids, at } => {
                    self.remote.update_last_recalled(ids, *at).await
                }
                PendingWrite::Rule(r) => self.remote.upsert_rule(r).await,
            };

            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(kind = write.kind(), error = %e, "remote still unavailable");
                    if let Ok(mut queue) = self.pending.lock() {
                        queue.push_front(write);
                    }
                    break;
                }
            }
        }
        if delivered > 0 {
            debug!(delivered, "flushed queued remote writes");
        }
        delivered
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
