//! `mnemo-store` – the Memory Store.
//!
//! Durable, workspace-scoped collection of memories and promoted trading
//! rules, backed by a local SQLite cache and an optional remote database.
//!
//! # Modules
//!
//! - [`local`] – [`LocalStore`][local::LocalStore]: SQLite persistence of
//!   memories with filtered queries and monotonic recall timestamps.
//! - [`rules`] – `trading_rules` persistence on the same connection.
//! - [`remote`] – [`RemoteStore`][remote::RemoteStore]: the authoritative
//!   remote leg, with a PostgREST client and a local-only stand-in.
//! - [`store`] – [`MemoryStore`][store::MemoryStore]: write-through store
//!   combining both legs with a retry queue for failed remote writes.
//! - [`filter`] – [`MemoryFilter`][filter::MemoryFilter] query builder.
//! - [`similarity`] – cosine, Jaccard and term-overlap similarity.

pub mod error;
pub mod filter;
pub mod local;
pub mod remote;
pub mod rules;
pub mod similarity;
pub mod store;

pub use error::StoreError;
pub use filter::{MemoryFilter, MemoryOrder};
pub use local::LocalStore;
pub use remote::{NoRemote, RemoteStore, RestRemote};
pub use store::{DEFAULT_RETRY_CAPACITY, MemoryStore, PendingWrite};
