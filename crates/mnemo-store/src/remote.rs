//! The authoritative remote leg of the memory store.
//!
//! The local SQLite cache serves every read.  Writes are mirrored to a
//! [`RemoteStore`]; the [`MemoryStore`][crate::MemoryStore] queues any write
//! the remote rejects so it can be retried later.
//!
//! - [`NoRemote`] – local-only operation.
//! - [`RestRemote`] – a PostgREST-style HTTP endpoint exposing `memories` and
//!   `trading_rules` tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mnemo_types::{Memory, Rule};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::local::ts_to_sql;

/// Write interface of the durable remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn insert_memory(&self, memory: &Memory) -> Result<(), StoreError>;

    /// Monotonic bulk update; must never move `last_recalled_at` backwards.
    async fn update_last_recalled(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Create or fully replace a rule keyed by its id.
    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError>;
}

/// A remote leg that accepts every write without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemote;

#[async_trait]
impl RemoteStore for NoRemote {
    async fn insert_memory(&self, _memory: &Memory) -> Result<(), StoreError> {
        Ok(())
    }

    async fn update_last_recalled(&self, _ids: &[Uuid], _at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_rule(&self, _rule: &Rule) -> Result<(), StoreError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RestRemote
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RecalledPatch {
    last_recalled_at: String,
}

/// HTTP client for a PostgREST-compatible database endpoint.
///
/// ```rust,no_run
/// use mnemo_store::RestRemote;
///
/// let remote = RestRemote::new("https://db.example.com/rest/v1", Some("service-key".into()));
/// ```
pub struct RestRemote {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RestRemote {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, table);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<(), StoreError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Remote(format!("HTTP {status}: {body}")))
    }
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn insert_memory(&self, memory: &Memory) -> Result<(), StoreError> {
        debug!(id = %memory.id, "mirroring memory to remote store");
        self.send(self.request(reqwest::Method::POST, "memories").json(memory))
            .await
    }

    async fn update_last_recalled(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ts = ts_to_sql(&at);
        let id_list = ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let builder = self
            .request(reqwest::Method::PATCH, "memories")
            .query(&[
                ("id", format!("in.({id_list})")),
                ("or", format!("(last_recalled_at.is.null,last_recalled_at.lt.{ts})")),
            ])
            .json(&RecalledPatch {
                last_recalled_at: ts,
            });
        self.send(builder).await
    }

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let builder = self
            .request(reqwest::Method::POST, "trading_rules")
            .header("Prefer", "resolution=merge-duplicates")
            .json(rule);
        self.send(builder).await
    }
}
