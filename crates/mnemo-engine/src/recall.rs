//! [`RecallEngine`] – ranked, cached memory retrieval.
//!
//! A recall turns a free-text query into a ranked list of memories of one
//! workspace:
//!
//! 1. Look the `(normalized query, workspace, options)` key up in a TTL cache.
//!    A hit is returned immediately with `used_cache = true`.
//! 2. Page through the candidates in the [`MemoryStore`] with every facet
//!    pushed into the store filter.
//! 3. Score each candidate as
//!    `similarity_weight · similarity + importance_weight · importance`, where
//!    similarity is the cosine of the query and memory embeddings when both
//!    exist and the lexical term overlap otherwise.
//! 4. Sort by score, then `financial_impact` descending, then newest first.
//! 5. Truncate to the limit and optionally hand the survivors to a
//!    [`Reranker`].
//! 6. Cache the result.
//!
//! Failures never escape: a store error or a timeout yields an empty
//! [`RecallResult`] with its `error` field set.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mini_moka::sync::{Cache, ConcurrentCacheExt};
use mnemo_store::similarity::{cosine_similarity, term_overlap};
use mnemo_store::{MemoryFilter, MemoryOrder, MemoryStore};
use mnemo_types::{Memory, MemoryType, MnemoError, ProtectionLevel};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::capability::{Embedder, Reranker};

/// Canned queries issued by [`RecallEngine::warm_cache`].
pub const WARM_QUERIES: [&str; 3] = [
    "recent critical lessons",
    "risk management rules",
    "costly trading mistakes",
];

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables of a [`RecallEngine`] instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RecallConfig {
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    /// Result size when [`RecallOptions::limit`] is unset.
    pub default_limit: usize,
    pub similarity_weight: f64,
    pub importance_weight: f64,
    /// Upper bound on a whole uncached recall, store and embedding included.
    pub timeout: Duration,
    /// Rows pulled from the store per page while scoring candidates.  Every
    /// matching row is scored; only the best `limit` are kept between pages.
    pub candidate_page_size: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 256,
            default_limit: 10,
            similarity_weight: 0.7,
            importance_weight: 0.3,
            timeout: Duration::from_secs(5),
            candidate_page_size: 500,
        }
    }
}

/// Per-call recall options.
#[derive(Debug, Clone, PartialEq)]
pub struct RecallOptions {
    pub limit: Option<usize>,
    pub min_importance: f64,
    pub use_cache: bool,
    pub rerank: bool,
    pub categories: Vec<String>,
    /// Ticker symbols, matched against memory tags.
    pub symbols: Vec<String>,
    /// Restrict to these memory types; empty means all.
    pub memory_types: Vec<MemoryType>,
    pub protection_level: Option<ProtectionLevel>,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            limit: None,
            min_importance: 0.0,
            use_cache: true,
            rerank: false,
            categories: Vec::new(),
            symbols: Vec::new(),
            memory_types: Vec::new(),
            protection_level: None,
        }
    }
}

impl RecallOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_min_importance(mut self, min: f64) -> Self {
        self.min_importance = min;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_rerank(mut self) -> Self {
        self.rerank = true;
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_memory_types(mut self, types: &[MemoryType]) -> Self {
        self.memory_types = types.to_vec();
        self
    }

    pub fn with_protection_level(mut self, level: ProtectionLevel) -> Self {
        self.protection_level = Some(level);
        self
    }
}

/// Outcome of one recall.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecallResult {
    pub memories: Vec<Memory>,
    /// Candidates that matched the filters, before truncation.
    pub total_found: usize,
    pub search_time_ms: u64,
    pub used_cache: bool,
    pub error: Option<MnemoError>,
}

impl RecallResult {
    fn failed(error: MnemoError, started: Instant) -> Self {
        Self {
            memories: Vec::new(),
            total_found: 0,
            search_time_ms: elapsed_ms(started),
            used_cache: false,
            error: Some(error),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    workspace_id: String,
    limit: usize,
    min_importance_bits: u64,
    rerank: bool,
    categories: Vec<String>,
    symbols: Vec<String>,
    memory_types: Vec<&'static str>,
    protection_level: Option<u8>,
}

impl CacheKey {
    fn new(query: &str, workspace_id: &str, options: &RecallOptions, limit: usize) -> Self {
        Self {
            query: normalize_query(query),
            workspace_id: workspace_id.to_string(),
            limit,
            min_importance_bits: options.min_importance.to_bits(),
            rerank: options.rerank,
            categories: normalized_facet(&options.categories),
            symbols: normalized_facet(&options.symbols),
            memory_types: {
                let mut types: Vec<_> = options.memory_types.iter().map(MemoryType::as_str).collect();
                types.sort_unstable();
                types.dedup();
                types
            },
            protection_level: options.protection_level.map(ProtectionLevel::as_u8),
        }
    }
}

/// Lower-case and collapse whitespace so trivially different spellings of a
/// query share one cache entry.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalized_facet(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[derive(Debug)]
struct CachedRecall {
    workspace_id: String,
    memories: Vec<Memory>,
    total_found: usize,
}

impl CachedRecall {
    fn check(&self, key: &CacheKey) -> Result<(), MnemoError> {
        if self.workspace_id != key.workspace_id
            || self.memories.iter().any(|m| m.workspace_id != key.workspace_id)
        {
            return Err(MnemoError::CacheCorruption(format!(
                "entry for workspace '{}' holds foreign memories",
                key.workspace_id
            )));
        }
        if self.memories.len() > key.limit {
            return Err(MnemoError::CacheCorruption(format!(
                "entry holds {} memories for limit {}",
                self.memories.len(),
                key.limit
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recall seam
// ─────────────────────────────────────────────────────────────────────────────

/// Anything that can answer a recall query.  Implemented by
/// [`RecallEngine`]; trigger recall and context assembly depend on this
/// trait so tests can count the calls they make.
#[async_trait]
pub trait MemoryRecall: Send + Sync {
    async fn recall(&self, query: &str, workspace_id: &str, options: &RecallOptions) -> RecallResult;
}

// ─────────────────────────────────────────────────────────────────────────────
// RecallEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Ranked retrieval over a [`MemoryStore`] with a private TTL cache.
pub struct RecallEngine {
    store: Arc<MemoryStore>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    cache: Cache<CacheKey, Arc<CachedRecall>>,
    config: RecallConfig,
}

impl RecallEngine {
    pub fn new(store: Arc<MemoryStore>, config: RecallConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            store,
            embedder: None,
            reranker: None,
            cache,
            config,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    /// Rank the memories of `workspace_id` against `query`.
    ///
    /// Never fails: errors are reported through [`RecallResult::error`] with
    /// an empty memory list.
    #[instrument(skip(self, options), fields(workspace = %workspace_id))]
    pub async fn recall(&self, query: &str, workspace_id: &str, options: &RecallOptions) -> RecallResult {
        let started = Instant::now();
        let limit = options.limit.unwrap_or(self.config.default_limit);
        let key = CacheKey::new(query, workspace_id, options, limit);

        if options.use_cache {
            if let Some(hit) = self.cached(&key) {
                debug!(count = hit.memories.len(), "recall served from cache");
                return RecallResult {
                    memories: hit.memories.clone(),
                    total_found: hit.total_found,
                    search_time_ms: elapsed_ms(started),
                    used_cache: true,
                    error: None,
                };
            }
        }

        let search = self.search(query, workspace_id, options, limit);
        let (memories, total_found) = match tokio::time::timeout(self.config.timeout, search).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(error = %e, "recall failed; returning empty result");
                return RecallResult::failed(e, started);
            }
            Err(_) => {
                let ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(timeout_ms = ms, "recall timed out; returning empty result");
                return RecallResult::failed(MnemoError::Timeout(ms), started);
            }
        };

        self.cache.insert(
            key,
            Arc::new(CachedRecall {
                workspace_id: workspace_id.to_string(),
                memories: memories.clone(),
                total_found,
            }),
        );
        debug!(count = memories.len(), total_found, "recall complete");

        RecallResult {
            memories,
            total_found,
            search_time_ms: elapsed_ms(started),
            used_cache: false,
            error: None,
        }
    }

    fn cached(&self, key: &CacheKey) -> Option<Arc<CachedRecall>> {
        let hit = self.cache.get(key)?;
        match hit.check(key) {
            Ok(()) => Some(hit),
            Err(e) => {
                warn!(error = %e, "discarding corrupted recall cache entry");
                self.cache.invalidate(key);
                None
            }
        }
    }

    async fn search(
        &self,
        query: &str,
        workspace_id: &str,
        options: &RecallOptions,
        limit: usize,
    ) -> Result<(Vec<Memory>, usize), MnemoError> {
        let page_size = self.config.candidate_page_size.max(1);
        let base = self.candidate_filter(workspace_id, options);
        let mut query_embedding: Option<Option<Vec<f32>>> = None;
        let mut best: Vec<(f64, Memory)> = Vec::new();
        let mut total_found = 0;
        let mut offset = 0;

        loop {
            let page = self.store.query(&base.clone().limit(page_size).offset(offset))?;
            let fetched = page.len();
            total_found += fetched;

            if limit > 0 && fetched > 0 {
                if query_embedding.is_none() {
                    query_embedding = Some(self.embed_query(query).await);
                }
                let embedding = query_embedding.as_ref().and_then(|e| e.as_deref());
                best.extend(page.into_iter().map(|m| (self.score(query, embedding, &m), m)));
                best.sort_by(compare_scored);
                best.truncate(limit);
            }

            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        let mut memories: Vec<Memory> = best.into_iter().map(|(_, m)| m).collect();
        if options.rerank && !memories.is_empty() {
            memories = self.rerank(query, memories).await;
        }
        Ok((memories, total_found))
    }

    fn candidate_filter(&self, workspace_id: &str, options: &RecallOptions) -> MemoryFilter {
        let mut filter = MemoryFilter::workspace(workspace_id)
            .memory_types(&options.memory_types)
            .categories(&options.categories)
            .tags_any(&options.symbols)
            .order(MemoryOrder::ImportanceDesc);
        if options.min_importance > 0.0 {
            filter = filter.min_importance(options.min_importance);
        }
        if let Some(level) = options.protection_level {
            filter = filter.protection_level(level);
        }
        filter
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(query).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                let err = MnemoError::from(e);
                debug!(error = %err, "falling back to lexical similarity");
                None
            }
        }
    }

    fn score(&self, query: &str, query_embedding: Option<&[f32]>, memory: &Memory) -> f64 {
        let similarity = match (query_embedding, memory.embedding.as_deref()) {
            (Some(q), Some(m)) if q.len() == m.len() => f64::from(cosine_similarity(q, m)).max(0.0),
            _ => term_overlap(query, &format!("{} {}", memory.content, memory.summary)),
        };
        self.config.similarity_weight * similarity + self.config.importance_weight * memory.importance_score
    }

    async fn rerank(&self, query: &str, memories: Vec<Memory>) -> Vec<Memory> {
        let Some(reranker) = &self.reranker else {
            return memories;
        };
        match reranker.rerank(query, memories.clone()).await {
            Ok(reordered) if is_permutation(&memories, &reordered) => reordered,
            Ok(_) => {
                warn!("reranker changed the candidate set; keeping first-pass order");
                memories
            }
            Err(e) => {
                warn!(error = %e, "rerank failed; keeping first-pass order");
                memories
            }
        }
    }

    /// Issue [`WARM_QUERIES`] for `workspace_id` so the first real turn can
    /// hit the cache.  Returns the number of queries that succeeded.
    pub async fn warm_cache(&self, workspace_id: &str) -> usize {
        let options = RecallOptions::default();
        let mut warmed = 0;
        for query in WARM_QUERIES {
            let result = self.recall(query, workspace_id, &options).await;
            match result.error {
                None => warmed += 1,
                Some(e) => warn!(query, error = %e, "cache warm-up query failed"),
            }
        }
        warmed
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
        self.cache.sync();
    }

    pub fn cache_len(&self) -> u64 {
        self.cache.sync();
        self.cache.entry_count()
    }
}

#[async_trait]
impl MemoryRecall for RecallEngine {
    async fn recall(&self, query: &str, workspace_id: &str, options: &RecallOptions) -> RecallResult {
        RecallEngine::recall(self, query, workspace_id, options).await
    }
}

fn compare_scored(a: &(f64, Memory), b: &(f64, Memory)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then_with(|| {
            let ia = a.1.financial_impact.unwrap_or(0.0);
            let ib = b.1.financial_impact.unwrap_or(0.0);
            ib.total_cmp(&ia)
        })
        .then_with(|| b.1.created_at.cmp(&a.1.created_at))
}

fn is_permutation(original: &[Memory], reordered: &[Memory]) -> bool {
    if original.len() != reordered.len() {
        return false;
    }
    let mut a: Vec<_> = original.iter().map(|m| m.id).collect();
    let mut b: Vec<_> = reordered.iter().map(|m| m.id).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

// ─────────────────────────────────────────────────────────────────────────────
// Formatting
// ─────────────────────────────────────────────────────────────────────────────

/// Render one memory as an indented two-line entry.  Shared by every block
/// formatter of the engine.
pub(crate) fn format_entry(out: &mut String, index: usize, memory: &Memory) {
    out.push_str(&format!(
        "{}. [{} | {} | importance {:.2}] {}\n",
        index,
        memory.memory_type.as_str().to_uppercase(),
        memory.protection_level.label(),
        memory.importance_score,
        memory.display_text()
    ));
    let mut details = Vec::new();
    if let Some(impact) = memory.financial_impact {
        details.push(format!("impact {impact:+.2}"));
    }
    if let Some(category) = &memory.category {
        details.push(format!("category {category}"));
    }
    if !memory.tags.is_empty() {
        details.push(format!("tags {}", memory.tags.join(", ")));
    }
    if !details.is_empty() {
        out.push_str(&format!("   {}\n", details.join("; ")));
    }
}

/// Deterministic prompt block for a ranked recall result.  Returns an empty
/// string for an empty list.
pub fn format_for_prompt(memories: &[Memory]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Relevant memories\n");
    for (i, memory) in memories.iter().enumerate() {
        format_entry(&mut out, i + 1, memory);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Maps a few known words onto fixed axes so cosine similarity is
    /// predictable.
    struct AxisEmbedder;

    fn axis_vector(text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        vec![
            if lowered.contains("drawdown") { 1.0 } else { 0.0 },
            if lowered.contains("earnings") { 1.0 } else { 0.0 },
            0.1,
        ]
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
            Ok(axis_vector(text))
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(vec![1.0])
        }
    }

    #[derive(Default)]
    struct ReversingReranker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(&self, _query: &str, mut candidates: Vec<Memory>) -> Result<Vec<Memory>, LlmError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            candidates.reverse();
            Ok(candidates)
        }
    }

    fn lesson(text: &str, importance: f64) -> Memory {
        Memory::new("ws", MemoryType::Lesson, text, text).with_importance(importance)
    }

    async fn store_with(memories: Vec<Memory>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        for m in memories {
            store.insert(m).await.unwrap();
            // Distinct created_at for recency tie-breaks.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        store
    }

    #[tokio::test]
    async fn identical_recalls_within_ttl_hit_the_cache() {
        let store = store_with(vec![
            lesson("Drawdown above 10% means cut size", 0.9),
            lesson("Earnings gaps ignore stops", 0.7),
        ])
        .await;
        let engine = RecallEngine::new(store, RecallConfig::default());
        let options = RecallOptions::default();

        let first = engine.recall("drawdown", "ws", &options).await;
        let second = engine.recall("drawdown", "ws", &options).await;

        assert!(!first.used_cache);
        assert!(second.used_cache);
        assert_eq!(
            serde_json::to_string(&first.memories).unwrap(),
            serde_json::to_string(&second.memories).unwrap()
        );
        assert_eq!(first.total_found, second.total_found);
    }

    #[tokio::test]
    async fn query_normalization_shares_cache_entries() {
        let store = store_with(vec![lesson("Drawdown rule", 0.5)]).await;
        let engine = RecallEngine::new(store, RecallConfig::default());
        let options = RecallOptions::default();

        engine.recall("Max  Drawdown", "ws", &options).await;
        let second = engine.recall("max drawdown", "ws", &options).await;
        assert!(second.used_cache);
    }

    #[tokio::test]
    async fn use_cache_false_always_searches() {
        let store = store_with(vec![lesson("Drawdown rule", 0.5)]).await;
        let engine = RecallEngine::new(store, RecallConfig::default());
        let options = RecallOptions::default().without_cache();

        engine.recall("drawdown", "ws", &options).await;
        let second = engine.recall("drawdown", "ws", &options).await;
        assert!(!second.used_cache);
    }

    #[tokio::test]
    async fn similarity_dominates_equal_importance() {
        let drawdown = lesson("Drawdown discipline", 0.5).with_embedding(axis_vector("drawdown"));
        let earnings = lesson("Earnings season", 0.5).with_embedding(axis_vector("earnings"));
        let store = store_with(vec![earnings, drawdown]).await;
        let engine = RecallEngine::new(store, RecallConfig::default()).with_embedder(Arc::new(AxisEmbedder));

        let result = engine.recall("drawdown limits", "ws", &RecallOptions::default()).await;
        assert_eq!(result.memories[0].content, "Drawdown discipline");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn lexical_overlap_is_used_without_embeddings() {
        let store = store_with(vec![
            lesson("Earnings gaps ignore stops", 0.5),
            lesson("Max drawdown breached twice", 0.5),
        ])
        .await;
        let engine = RecallEngine::new(store, RecallConfig::default());

        let result = engine.recall("drawdown", "ws", &RecallOptions::default()).await;
        assert_eq!(result.memories[0].content, "Max drawdown breached twice");
        assert_eq!(result.total_found, 2);
    }

    #[tokio::test]
    async fn ties_break_on_financial_impact_then_recency() {
        let store = store_with(vec![
            lesson("alpha", 0.5).with_financial_impact(-500.0),
            lesson("beta", 0.5).with_financial_impact(200.0),
            lesson("gamma", 0.5),
            lesson("delta", 0.5),
        ])
        .await;
        let engine = RecallEngine::new(store, RecallConfig::default());

        let result = engine.recall("unrelated", "ws", &RecallOptions::default()).await;
        let order: Vec<_> = result.memories.iter().map(|m| m.content.as_str()).collect();
        // gamma and delta tie at impact 0; delta was stored last.
        assert_eq!(order, vec!["beta", "delta", "gamma", "alpha"]);
    }

    #[tokio::test]
    async fn limit_and_min_importance_are_applied() {
        let store = store_with(vec![
            lesson("drawdown one", 0.9),
            lesson("drawdown two", 0.8),
            lesson("drawdown three", 0.2),
        ])
        .await;
        let engine = RecallEngine::new(store, RecallConfig::default());
        let options = RecallOptions::default().with_limit(1).with_min_importance(0.5);

        let result = engine.recall("drawdown", "ws", &options).await;
        assert_eq!(result.memories.len(), 1);
        assert_eq!(result.total_found, 2);
        assert_eq!(result.memories[0].content, "drawdown one");
    }

    #[tokio::test]
    async fn every_candidate_is_scored_across_pages() {
        let store = store_with(vec![
            lesson("unrelated note 0", 0.5),
            lesson("unrelated note 1", 0.5),
            lesson("unrelated note 2", 0.5),
            lesson("Drawdown discipline", 0.5),
        ])
        .await;
        let config = RecallConfig {
            candidate_page_size: 3,
            ..RecallConfig::default()
        };
        let engine = RecallEngine::new(store, config);

        let result = engine.recall("drawdown", "ws", &RecallOptions::default().with_limit(2)).await;
        assert_eq!(result.total_found, 4);
        assert_eq!(result.memories.len(), 2);
        assert_eq!(result.memories[0].content, "Drawdown discipline");
    }

    #[tokio::test]
    async fn facets_filter_in_the_store() {
        let store = store_with(vec![
            lesson("tsla gap", 0.5).with_tags(["TSLA"]).with_category("Earnings"),
            lesson("spy trend", 0.5).with_tags(["SPY"]).with_category("trend"),
        ])
        .await;
        let engine = RecallEngine::new(store, RecallConfig::default());

        let by_symbol = engine
            .recall("gap", "ws", &RecallOptions::default().with_symbols(["tsla"]))
            .await;
        assert_eq!(by_symbol.memories.len(), 1);
        assert_eq!(by_symbol.memories[0].content, "tsla gap");

        let by_category = engine
            .recall("gap", "ws", &RecallOptions::default().with_categories(["trend"]))
            .await;
        assert_eq!(by_category.memories.len(), 1);
        assert_eq!(by_category.memories[0].content, "spy trend");
    }

    #[tokio::test]
    async fn other_workspaces_are_invisible() {
        let store = store_with(vec![lesson("mine", 0.5)]).await;
        store
            .insert(Memory::new("other", MemoryType::Lesson, "theirs", "theirs"))
            .await
            .unwrap();
        let engine = RecallEngine::new(store, RecallConfig::default());

        let result = engine.recall("theirs", "ws", &RecallOptions::default()).await;
        assert_eq!(result.total_found, 1);
        assert_eq!(result.memories[0].content, "mine");
    }

    #[tokio::test]
    async fn timeout_resolves_to_empty_result() {
        let store = store_with(vec![lesson("drawdown", 0.5)]).await;
        let config = RecallConfig {
            timeout: Duration::from_millis(20),
            ..RecallConfig::default()
        };
        let engine = RecallEngine::new(store, config).with_embedder(Arc::new(SlowEmbedder));

        let result = engine.recall("drawdown", "ws", &RecallOptions::default()).await;
        assert!(result.memories.is_empty());
        assert!(matches!(result.error, Some(MnemoError::Timeout(20))));
        assert_eq!(engine.cache_len(), 0);
    }

    #[tokio::test]
    async fn corrupted_cache_entry_is_a_miss() {
        let store = store_with(vec![lesson("drawdown", 0.5)]).await;
        let engine = RecallEngine::new(store, RecallConfig::default());
        let options = RecallOptions::default();
        let key = CacheKey::new("drawdown", "ws", &options, 10);
        engine.cache.insert(
            key,
            Arc::new(CachedRecall {
                workspace_id: "ws".into(),
                memories: vec![Memory::new("intruder", MemoryType::Fact, "x", "x")],
                total_found: 1,
            }),
        );

        let result = engine.recall("drawdown", "ws", &options).await;
        assert!(!result.used_cache);
        assert!(result.error.is_none());
        assert_eq!(result.memories[0].workspace_id, "ws");
    }

    #[tokio::test]
    async fn rerank_reorders_only_when_requested() {
        let store = store_with(vec![lesson("drawdown a", 0.9), lesson("drawdown b", 0.1)]).await;
        let reranker = Arc::new(ReversingReranker::default());
        let engine = RecallEngine::new(store, RecallConfig::default()).with_reranker(reranker.clone());

        let plain = engine.recall("drawdown", "ws", &RecallOptions::default()).await;
        assert_eq!(plain.memories[0].content, "drawdown a");
        assert_eq!(reranker.calls.load(AtomicOrdering::SeqCst), 0);

        let reranked = engine
            .recall("drawdown", "ws", &RecallOptions::default().with_rerank())
            .await;
        assert_eq!(reranked.memories[0].content, "drawdown b");
        assert_eq!(reranker.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn warm_cache_populates_entries_and_invalidate_clears_them() {
        let store = store_with(vec![lesson("critical lesson", 0.9)]).await;
        let engine = RecallEngine::new(store, RecallConfig::default());

        assert_eq!(engine.warm_cache("ws").await, WARM_QUERIES.len());
        assert_eq!(engine.cache_len(), WARM_QUERIES.len() as u64);

        engine.invalidate_cache();
        assert_eq!(engine.cache_len(), 0);
    }

    #[test]
    fn prompt_format_is_stable() {
        let m = lesson("Never average down", 0.8)
            .with_financial_impact(-1200.0)
            .with_category("risk")
            .with_tags(["TSLA", "NVDA"]);
        let text = format_for_prompt(std::slice::from_ref(&m));
        assert_eq!(text, format_for_prompt(&[m]));
        assert!(text.starts_with("## Relevant memories\n1. [LESSON | STANDARD | importance 0.80] Never average down\n"));
        assert!(text.contains("impact -1200.00; category risk; tags TSLA, NVDA"));
        assert_eq!(format_for_prompt(&[]), "");
    }
}
