//! Local memory cache.
//!
//! Persists [`Memory`] records to a local SQLite database so recall keeps
//! working when the remote store is unreachable.
//!
//! # Storage layout
//!
//! | column           | type    | description                                   |
//! |------------------|---------|-----------------------------------------------|
//! | id               | TEXT    | UUID v4 primary key                           |
//! | workspace_id     | TEXT    | Tenant scope                                  |
//! | content          | TEXT    | Full memory text                              |
//! | summary          | TEXT    | Short display text                            |
//! | memory_type      | TEXT    | `fact`, `lesson`, `pattern` or `rule`         |
//! | importance_score | REAL    | `[0, 1]`, enforced by a CHECK constraint      |
//! | protection_level | INTEGER | `0..=3`, enforced by a CHECK constraint       |
//! | financial_impact | REAL    | Optional signed cost                          |
//! | category         | TEXT    | Optional free-form category                   |
//! | tags             | TEXT    | JSON array of strings                         |
//! | embedding        | BLOB    | Little-endian f32 vector, NULL when absent    |
//! | created_at       | TEXT    | RFC-3339 UTC, fixed microsecond precision     |
//! | last_recalled_at | TEXT    | Same format, NULL when never recalled         |
//!
//! Timestamps use a fixed-width format so that SQL string comparison orders
//! them chronologically.
//!
//! # Example
//!
//! ```rust
//! use mnemo_store::{LocalStore, MemoryFilter};
//! use mnemo_types::{Memory, MemoryType};
//!
//! let store = LocalStore::open_in_memory().unwrap();
//! let memory = Memory::new("desk-1", MemoryType::Lesson, "Never average down.", "no averaging down");
//! store.insert(&memory).unwrap();
//!
//! let found = store.query(&MemoryFilter::workspace("desk-1")).unwrap();
//! assert_eq!(found[0].id, memory.id);
//! ```

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use mnemo_types::{Memory, MemoryType, ProtectionLevel};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

use crate::error::StoreError;
use crate::filter::MemoryFilter;

const MEMORY_COLUMNS: &str = "id, workspace_id, content, summary, memory_type, importance_score, \
     protection_level, financial_impact, category, tags, embedding, created_at, last_recalled_at";

// ─────────────────────────────────────────────────────────────────────────────
// Serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Fixed-width RFC-3339 rendering used for every stored timestamp.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_error(idx, e))
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let id: String = row.get(0)?;
    let memory_type: String = row.get(4)?;
    let level: u8 = row.get(6)?;
    let tags: String = row.get(9)?;
    let embedding: Option<Vec<u8>> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let last_recalled_at: Option<String> = row.get(12)?;

    Ok(Memory {
        id: parse_uuid(0, &id)?,
        workspace_id: row.get(1)?,
        content: row.get(2)?,
        summary: row.get(3)?,
        memory_type: memory_type
            .parse::<MemoryType>()
            .map_err(|e| conversion_error(4, e))?,
        importance_score: row.get(5)?,
        protection_level: ProtectionLevel::try_from(level).map_err(|e| conversion_error(6, e))?,
        financial_impact: row.get(7)?,
        category: row.get(8)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_error(9, e))?,
        embedding: embedding.map(|b| bytes_to_embedding(&b)),
        created_at: parse_ts(11, &created_at)?,
        last_recalled_at: last_recalled_at
            .map(|raw| parse_ts(12, &raw))
            .transpose()?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// LocalStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed local leg of the memory store.
///
/// The connection sits behind a mutex so the store can be shared between the
/// daemon and on-demand recall callers.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                id               TEXT NOT NULL PRIMARY KEY,
                workspace_id     TEXT NOT NULL,
                content          TEXT NOT NULL,
                summary          TEXT NOT NULL,
                memory_type      TEXT NOT NULL,
                importance_score REAL NOT NULL CHECK (importance_score BETWEEN 0.0 AND 1.0),
                protection_level INTEGER NOT NULL CHECK (protection_level BETWEEN 0 AND 3),
                financial_impact REAL,
                category         TEXT,
                tags             TEXT NOT NULL DEFAULT '[]',
                embedding        BLOB,
                created_at       TEXT NOT NULL,
                last_recalled_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_memories_workspace_level
                ON memories (workspace_id, protection_level);
            CREATE TABLE IF NOT EXISTS trading_rules (
                id                    TEXT NOT NULL PRIMARY KEY,
                workspace_id          TEXT NOT NULL,
                content               TEXT NOT NULL,
                rule_type             TEXT NOT NULL,
                confidence            REAL NOT NULL,
                supporting_memory_ids TEXT NOT NULL,
                success_count         INTEGER NOT NULL,
                active                INTEGER NOT NULL,
                created_at            TEXT NOT NULL,
                last_validated_at     TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Persist `memory` exactly as given.
    ///
    /// Returns [`StoreError::InvalidMemory`] when the record breaks a schema
    /// invariant and a SQLite error when the id already exists.
    pub fn insert(&self, memory: &Memory) -> Result<(), StoreError> {
        memory.validate()?;
        let tags = serde_json::to_string(&memory.tags)
            .map_err(|e| StoreError::InvalidMemory(e.to_string()))?;
        self.lock()?.execute(
            &format!(
                "INSERT INTO memories ({MEMORY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                memory.id.to_string(),
                memory.workspace_id,
                memory.content,
                memory.summary,
                memory.memory_type.as_str(),
                memory.importance_score,
                memory.protection_level.as_u8(),
                memory.financial_impact,
                memory.category,
                tags,
                memory.embedding.as_deref().map(embedding_to_bytes),
                ts_to_sql(&memory.created_at),
                memory.last_recalled_at.as_ref().map(ts_to_sql),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single memory by id.
    pub fn get(&self, id: Uuid) -> Result<Option<Memory>, StoreError> {
        let conn = self.lock()?;
        let memory = conn
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id.to_string()],
                row_to_memory,
            )
            .optional()?;
        Ok(memory)
    }

    /// Return every memory matching `filter`.
    pub fn query(&self, filter: &MemoryFilter) -> Result<Vec<Memory>, StoreError> {
        let (tail, values) = filter.to_sql();
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {MEMORY_COLUMNS} FROM memories{tail}"))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_memory)?;
        let mut memories = Vec::new();
        for row in rows {
            memories.push(row?);
        }
        Ok(memories)
    }

    /// Number of memories stored for `workspace_id`.
    pub fn count(&self, workspace_id: &str) -> Result<usize, StoreError> {
        let n: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM memories WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Advance `last_recalled_at` to `at` for every id whose current value is
    /// older (or unset).  Never rewinds.  Returns the number of rows changed.
    pub fn update_last_recalled(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize, StoreError> {
        let ts = ts_to_sql(&at);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE memories SET last_recalled_at = ?1
                 WHERE id = ?2 AND (last_recalled_at IS NULL OR last_recalled_at < ?1)",
            )?;
            for id in ids {
                changed += stmt.execute(params![ts, id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
