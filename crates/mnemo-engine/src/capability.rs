//! External capabilities the engine depends on.
//!
//! The engine never talks to a model server or a session log directly; it
//! goes through these traits so hosts can plug in their own providers and
//! tests can plug in deterministic fakes.  [`LlmDriver`][crate::llm::LlmDriver]
//! implements the three LLM-backed traits.

use async_trait::async_trait;
use mnemo_types::{Memory, MnemoError};
use serde::{Deserialize, Serialize};

use crate::llm::LlmError;

/// Turns text into a fixed-length embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

/// Second-pass ordering of an already ranked candidate list.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Return `candidates` in a new order.  Implementations must not add
    /// memories that were not in the input.
    async fn rerank(&self, query: &str, candidates: Vec<Memory>) -> Result<Vec<Memory>, LlmError>;
}

/// One unit of session activity the daemon can learn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionActivity {
    pub session_id: String,
    pub workspace_id: String,
    pub transcript: String,
}

/// Summarises session activity into new memories.
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(&self, activity: &SessionActivity) -> Result<Vec<Memory>, LlmError>;
}

/// Where the daemon finds activity that has not been mined yet.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn pending_sessions(&self, workspace_id: &str) -> Result<Vec<SessionActivity>, MnemoError>;

    /// Called once a session's memories are stored so it is not mined again.
    async fn mark_processed(&self, session_id: &str) -> Result<(), MnemoError>;
}
