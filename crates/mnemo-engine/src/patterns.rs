//! Pattern mining and rule promotion.
//!
//! The [`PatternDetector`] looks for three kinds of regularity:
//!
//! | pattern                      | source                                   | promoted |
//! |------------------------------|------------------------------------------|----------|
//! | `repeated_lesson`            | clusters of near-identical lessons       | yes      |
//! | `regime_profile_correlation` | pre-aggregated backtest statistics       | no       |
//! | `failure_mode`               | costly lessons sharing a category        | no       |
//!
//! Clustering is greedy and order dependent: with a non-transitive
//! similarity (A~B, B~C, A≁C) membership depends on input order, so lessons
//! are always fetched oldest first.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mnemo_store::similarity::{jaccard_of_sets, word_set};
use mnemo_store::{MemoryFilter, MemoryOrder, MemoryStore, StoreError};
use mnemo_types::{Memory, MemoryType, MnemoError, Pattern, PatternType, Rule, RuleType};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lessons below this importance are not mined.
pub const MIN_LESSON_IMPORTANCE: f64 = 0.6;
/// Seed plus at least two similar lessons.
pub const MIN_CLUSTER_SIZE: usize = 3;
/// Jaccard similarity a lesson must exceed to join a seed's cluster.
pub const SIMILARITY_THRESHOLD: f64 = 0.7;
pub const MIN_REGIME_RUNS: u32 = 5;
pub const BEST_REGIME_SHARPE: f64 = 0.5;
pub const FAILING_REGIME_SHARPE: f64 = 0.0;
/// Costly lessons per category needed for a failure mode.
pub const MIN_FAILURE_MODE_LESSONS: usize = 3;

/// Step mapping from evidence count to confidence.
pub fn evidence_confidence(n: usize) -> f64 {
    match n {
        0..=4 => 0.6,
        5..=9 => 0.85,
        _ => 0.95,
    }
}

const RULE_KEYWORDS: [(RuleType, &[&str]); 4] = [
    (RuleType::Entry, &["entry", "enter"]),
    (RuleType::Exit, &["exit", "close"]),
    (RuleType::Risk, &["risk", "size", "loss"]),
    (RuleType::PositionSizing, &["position", "capital"]),
];

/// First keyword family found in `content` wins; `general` otherwise.
pub fn classify_rule_type(content: &str) -> RuleType {
    let lowered = content.to_lowercase();
    RULE_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lowered.contains(w)))
        .map_or(RuleType::General, |(rule_type, _)| *rule_type)
}

/// Greedy single-pass clustering over the word sets of `texts`.
///
/// Each unvisited text seeds a cluster of every other unvisited text whose
/// Jaccard similarity to the seed exceeds `threshold`.  Only clusters of at
/// least `min_size` members are returned and only their members are marked
/// visited, so a seed whose own cluster fell short can still join a later
/// one.  Returns clusters as index lists, seed first.
pub fn cluster_by_similarity(texts: &[&str], threshold: f64, min_size: usize) -> Vec<Vec<usize>> {
    let sets: Vec<HashSet<String>> = texts.iter().map(|t| word_set(t)).collect();
    let mut visited = vec![false; sets.len()];
    let mut clusters = Vec::new();

    for seed in 0..sets.len() {
        if visited[seed] {
            continue;
        }
        let cluster: Vec<usize> = std::iter::once(seed)
            .chain((0..sets.len()).filter(|&j| {
                j != seed && !visited[j] && jaccard_of_sets(&sets[seed], &sets[j]) > threshold
            }))
            .collect();
        if cluster.len() >= min_size {
            for &member in &cluster {
                visited[member] = true;
            }
            clusters.push(cluster);
        }
    }
    clusters
}

// ─────────────────────────────────────────────────────────────────────────────
// Regime / profile statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregated performance of one strategy profile in one market regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeProfileStats {
    pub profile_id: String,
    pub regime_id: String,
    pub avg_sharpe: f64,
    pub total_runs: u32,
    pub confidence_score: f64,
    pub run_ids: Vec<Uuid>,
}

/// Provider of pre-aggregated regime/profile statistics.
#[async_trait]
pub trait RegimeStatsSource: Send + Sync {
    async fn regime_profile_stats(&self, workspace_id: &str) -> Result<Vec<RegimeProfileStats>, MnemoError>;
}

/// Best and failing regime of every profile.
///
/// The best and worst regimes are picked over all of a profile's entries;
/// each is reported only when it has at least [`MIN_REGIME_RUNS`] runs and
/// clears its Sharpe threshold.
pub fn regime_profile_patterns(stats: &[RegimeProfileStats]) -> Vec<Pattern> {
    let mut by_profile: BTreeMap<&str, Vec<&RegimeProfileStats>> = BTreeMap::new();
    for s in stats {
        by_profile.entry(s.profile_id.as_str()).or_default().push(s);
    }

    let mut patterns = Vec::new();
    for (profile, entries) in by_profile {
        let best = entries.iter().max_by(|a, b| a.avg_sharpe.total_cmp(&b.avg_sharpe));
        let worst = entries.iter().min_by(|a, b| a.avg_sharpe.total_cmp(&b.avg_sharpe));

        let enough_runs = |s: &&&RegimeProfileStats| s.total_runs >= MIN_REGIME_RUNS;

        if let Some(best) = best.filter(enough_runs).filter(|s| s.avg_sharpe > BEST_REGIME_SHARPE) {
            patterns.push(regime_pattern(
                format!(
                    "Profile {profile} performs best in regime {} (avg Sharpe {:.2} over {} runs)",
                    best.regime_id, best.avg_sharpe, best.total_runs
                ),
                best,
            ));
        }
        if let Some(worst) = worst.filter(enough_runs).filter(|s| s.avg_sharpe < FAILING_REGIME_SHARPE) {
            patterns.push(regime_pattern(
                format!(
                    "Profile {profile} fails in regime {} (avg Sharpe {:.2} over {} runs)",
                    worst.regime_id, worst.avg_sharpe, worst.total_runs
                ),
                worst,
            ));
        }
    }
    patterns
}

fn regime_pattern(description: String, stats: &RegimeProfileStats) -> Pattern {
    Pattern {
        pattern_type: PatternType::RegimeProfileCorrelation,
        description,
        evidence_count: stats.total_runs as usize,
        confidence: stats.confidence_score.clamp(0.0, 1.0),
        supporting_memory_ids: stats.run_ids.clone(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PatternDetector
// ─────────────────────────────────────────────────────────────────────────────

pub struct PatternDetector {
    store: Arc<MemoryStore>,
    regime_source: Option<Arc<dyn RegimeStatsSource>>,
    /// Serialises the read-then-write of rule promotion.
    promotion_lock: Mutex<()>,
}

impl PatternDetector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            regime_source: None,
            promotion_lock: Mutex::new(()),
        }
    }

    pub fn with_regime_source(mut self, source: Arc<dyn RegimeStatsSource>) -> Self {
        self.regime_source = Some(source);
        self
    }

    /// Cluster important lessons and promote every qualifying cluster.
    ///
    /// A failed promotion is logged and the pattern is still returned; the
    /// remaining clusters are processed regardless.
    #[instrument(skip(self), fields(workspace = %workspace_id))]
    pub async fn detect_repeated_lessons(&self, workspace_id: &str) -> Result<Vec<Pattern>, MnemoError> {
        let lessons = self.store.query(
            &MemoryFilter::workspace(workspace_id)
                .memory_type(MemoryType::Lesson)
                .min_importance(MIN_LESSON_IMPORTANCE)
                .order(MemoryOrder::CreatedAsc),
        )?;
        if lessons.len() < MIN_CLUSTER_SIZE {
            debug!(lessons = lessons.len(), "not enough lessons to mine");
            return Ok(Vec::new());
        }

        let texts: Vec<&str> = lessons.iter().map(|m| m.content.as_str()).collect();
        let clusters = cluster_by_similarity(&texts, SIMILARITY_THRESHOLD, MIN_CLUSTER_SIZE);

        let mut patterns = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let members: Vec<&Memory> = cluster.iter().map(|&i| &lessons[i]).collect();
            let seed = members[0];
            let n = members.len();
            let pattern = Pattern {
                pattern_type: PatternType::RepeatedLesson,
                description: format!("Repeated lesson ({n} occurrences): {}", seed.display_text()),
                evidence_count: n,
                confidence: evidence_confidence(n),
                supporting_memory_ids: members.iter().map(|m| m.id).collect(),
            };

            if let Err(e) = self.promote_to_rule(seed, &pattern.supporting_memory_ids).await {
                warn!(seed = %seed.id, error = %e, "rule promotion failed; continuing");
            }
            patterns.push(pattern);
        }
        info!(patterns = patterns.len(), "repeated lesson detection complete");
        Ok(patterns)
    }

    /// Create or refresh the rule of `seed`'s lesson family.
    ///
    /// An existing rule whose content contains the seed's summary is updated
    /// in place: its supporting ids are replaced, `success_count` is set to
    /// the cluster size and `last_validated_at` is bumped.  Re-running with
    /// the same cluster converges to the same rule.
    pub async fn promote_to_rule(&self, seed: &Memory, supporting: &[Uuid]) -> Result<Rule, MnemoError> {
        let _guard = self.promotion_lock.lock().await;
        let now = Utc::now();
        let needle = seed.display_text().to_lowercase();
        let n = supporting.len();

        let existing = self
            .store
            .list_rules(&seed.workspace_id)?
            .into_iter()
            .find(|r| r.content.to_lowercase().contains(&needle));

        match existing {
            Some(mut rule) => {
                rule.supporting_memory_ids = supporting.to_vec();
                rule.success_count = u32::try_from(n).unwrap_or(u32::MAX);
                rule.last_validated_at = now;
                self.store.update_rule(&rule).await.map_err(|e| match e {
                    StoreError::NotFound(id) => MnemoError::PromotionConflict(id),
                    other => MnemoError::from(other),
                })?;
                debug!(rule = %rule.id, success_count = rule.success_count, "rule revalidated");
                Ok(rule)
            }
            None => {
                let rule = Rule {
                    id: Uuid::new_v4(),
                    workspace_id: seed.workspace_id.clone(),
                    content: seed.display_text().to_string(),
                    rule_type: classify_rule_type(&seed.content),
                    confidence: (n as f64 / 5.0).min(1.0),
                    supporting_memory_ids: supporting.to_vec(),
                    success_count: u32::try_from(n).unwrap_or(u32::MAX),
                    active: true,
                    created_at: now,
                    last_validated_at: now,
                };
                self.store.insert_rule(&rule).await?;
                info!(rule = %rule.id, rule_type = %rule.rule_type, "rule promoted");
                Ok(rule)
            }
        }
    }

    /// Correlate strategy profiles with market regimes.  Returns nothing when
    /// no statistics source is configured.
    #[instrument(skip(self), fields(workspace = %workspace_id))]
    pub async fn detect_regime_profile_patterns(&self, workspace_id: &str) -> Result<Vec<Pattern>, MnemoError> {
        let Some(source) = &self.regime_source else {
            debug!("no regime statistics source configured");
            return Ok(Vec::new());
        };
        let stats = source.regime_profile_stats(workspace_id).await?;
        Ok(regime_profile_patterns(&stats))
    }

    /// Categories where costly lessons keep recurring.
    #[instrument(skip(self), fields(workspace = %workspace_id))]
    pub fn detect_failure_modes(&self, workspace_id: &str) -> Result<Vec<Pattern>, MnemoError> {
        let costly = self.store.query(
            &MemoryFilter::workspace(workspace_id)
                .memory_type(MemoryType::Lesson)
                .negative_impact_only()
                .order(MemoryOrder::CreatedAsc),
        )?;

        let mut by_category: BTreeMap<String, Vec<&Memory>> = BTreeMap::new();
        for m in &costly {
            if let Some(category) = m.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                by_category.entry(category.to_lowercase()).or_default().push(m);
            }
        }

        Ok(by_category
            .into_iter()
            .filter(|(_, members)| members.len() >= MIN_FAILURE_MODE_LESSONS)
            .map(|(category, members)| {
                let total: f64 = members.iter().filter_map(|m| m.financial_impact).sum();
                Pattern {
                    pattern_type: PatternType::FailureMode,
                    description: format!(
                        "Recurring losses in '{category}': {} lessons, total impact {total:.2}",
                        members.len()
                    ),
                    evidence_count: members.len(),
                    confidence: evidence_confidence(members.len()),
                    supporting_memory_ids: members.iter().map(|m| m.id).collect(),
                }
            })
            .collect())
    }
}
