//! `mnemo-engine` – the memory and recall engine.
//!
//! Sits on top of [`mnemo_store::MemoryStore`] and keeps an LLM-driven
//! trading workflow from forgetting what it learned.
//!
//! # Modules
//!
//! - [`recall`] – [`RecallEngine`][recall::RecallEngine]: ranks memories
//!   against a query by embedding (or lexical) similarity and importance,
//!   behind a TTL cache.  [`format_for_prompt`][recall::format_for_prompt]
//!   renders the result for a downstream prompt.
//! - [`stale`] – [`StaleMemoryInjector`][stale::StaleMemoryInjector]:
//!   selects memories overdue for reinforcement by protection level.
//! - [`trigger`] – [`TriggerRecall`][trigger::TriggerRecall]: keyword rules
//!   that proactively issue canned recall queries.
//! - [`patterns`] – [`PatternDetector`][patterns::PatternDetector]: clusters
//!   repeated lessons and promotes them into trading rules; also reports
//!   regime/profile correlations and failure modes.
//! - [`daemon`] – [`MemoryDaemon`][daemon::MemoryDaemon]: periodic
//!   extraction of new memories from session activity.
//! - [`events`] – [`EventHub`][events::EventHub]: daemon events through
//!   subscription handles or a broadcast channel.
//! - [`context`] – [`ContextAssembler`][context::ContextAssembler]: the
//!   per-turn combination of all of the above.
//! - [`capability`] – traits for the external embedder, reranker, extractor
//!   and activity source.
//! - [`llm`] – [`LlmDriver`][llm::LlmDriver]: OpenAI-compatible client
//!   implementing the LLM-backed capabilities.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP export.
//!
//! # Failure policy
//!
//! Recall-path operations never return `Err`: recall, trigger checks and
//! context assembly degrade to empty output and report what went wrong in an
//! `error` field.  The daemon reports failures as events.

pub mod capability;
pub mod context;
pub mod daemon;
pub mod events;
pub mod llm;
pub mod patterns;
pub mod recall;
pub mod stale;
pub mod telemetry;
pub mod trigger;

pub use capability::{ActivitySource, Embedder, MemoryExtractor, Reranker, SessionActivity};
pub use context::{ContextAssembler, InjectedContext};
pub use daemon::{CycleReport, DaemonConfig, MemoryDaemon};
pub use events::{EventHub, Subscription};
pub use llm::{ChatMessage, LlmDriver, LlmError, Role};
pub use patterns::{PatternDetector, RegimeProfileStats, RegimeStatsSource};
pub use recall::{MemoryRecall, RecallConfig, RecallEngine, RecallOptions, RecallResult, format_for_prompt};
pub use stale::{StaleMemory, StaleMemoryInjector, format_for_injection};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use trigger::{TriggerRecall, TriggeredMemory, default_trigger_rules, format_triggered_memories};
