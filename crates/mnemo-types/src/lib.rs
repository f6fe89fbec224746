//! `mnemo-types` – shared vocabulary of the memory engine.
//!
//! Every other crate speaks in terms of these types: the [`Memory`] record,
//! its [`ProtectionLevel`] tier, the static [`TriggerRule`] configuration,
//! the ephemeral [`Pattern`] produced by mining, the durable [`Rule`] it is
//! promoted into, and the [`MnemoError`] taxonomy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// MemoryType
// ─────────────────────────────────────────────────────────────────────────────

/// What kind of knowledge a [`Memory`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Fact,
    Lesson,
    Pattern,
    Rule,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Lesson => "lesson",
            MemoryType::Pattern => "pattern",
            MemoryType::Rule => "rule",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = MnemoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fact" => Ok(MemoryType::Fact),
            "lesson" => Ok(MemoryType::Lesson),
            "pattern" => Ok(MemoryType::Pattern),
            "rule" => Ok(MemoryType::Rule),
            other => Err(MnemoError::InvalidMemory(format!("unknown memory type '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProtectionLevel
// ─────────────────────────────────────────────────────────────────────────────

/// Criticality tier of a memory.  Lower is more critical and must be
/// reinforced more often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum ProtectionLevel {
    Immutable = 0,
    Protected = 1,
    Standard = 2,
    Ephemeral = 3,
}

impl ProtectionLevel {
    /// All levels, most critical first.
    pub const ALL: [ProtectionLevel; 4] = [
        ProtectionLevel::Immutable,
        ProtectionLevel::Protected,
        ProtectionLevel::Standard,
        ProtectionLevel::Ephemeral,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Mandated maximum gap between two recalls of a memory at this level.
    pub fn recall_interval(self) -> TimeDelta {
        match self {
            ProtectionLevel::Immutable => TimeDelta::days(3),
            ProtectionLevel::Protected => TimeDelta::days(7),
            ProtectionLevel::Standard => TimeDelta::days(30),
            ProtectionLevel::Ephemeral => TimeDelta::days(90),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProtectionLevel::Immutable => "IMMUTABLE",
            ProtectionLevel::Protected => "PROTECTED",
            ProtectionLevel::Standard => "STANDARD",
            ProtectionLevel::Ephemeral => "EPHEMERAL",
        }
    }
}

impl TryFrom<u8> for ProtectionLevel {
    type Error = MnemoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtectionLevel::Immutable),
            1 => Ok(ProtectionLevel::Protected),
            2 => Ok(ProtectionLevel::Standard),
            3 => Ok(ProtectionLevel::Ephemeral),
            other => Err(MnemoError::InvalidMemory(format!(
                "protection level {other} is outside 0..=3"
            ))),
        }
    }
}

impl From<ProtectionLevel> for u8 {
    fn from(level: ProtectionLevel) -> u8 {
        level.as_u8()
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

/// The unit of recall: a fact, lesson, pattern or rule learned from past
/// strategy runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    /// Tenant scope; every query is restricted to one workspace.
    pub workspace_id: String,
    pub content: String,
    /// Short form used for display and for rule de-duplication.
    pub summary: String,
    pub memory_type: MemoryType,
    /// Ranking and reinforcement weight in `[0.0, 1.0]`.
    pub importance_score: f64,
    pub protection_level: ProtectionLevel,
    /// Realized cost (or gain) attached to the lesson, used as a tie-break.
    pub financial_impact: Option<f64>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    /// `None` means the memory has never been recalled.
    pub last_recalled_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Build a memory with a fresh id, `STANDARD` protection and a neutral
    /// importance of `0.5`.
    pub fn new(
        workspace_id: impl Into<String>,
        memory_type: MemoryType,
        content: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            content: content.into(),
            summary: summary.into(),
            memory_type,
            importance_score: 0.5,
            protection_level: ProtectionLevel::Standard,
            financial_impact: None,
            category: None,
            tags: Vec::new(),
            embedding: None,
            created_at: Utc::now(),
            last_recalled_at: None,
        }
    }

    pub fn with_importance(mut self, score: f64) -> Self {
        self.importance_score = score;
        self
    }

    pub fn with_protection(mut self, level: ProtectionLevel) -> Self {
        self.protection_level = level;
        self
    }

    pub fn with_financial_impact(mut self, impact: f64) -> Self {
        self.financial_impact = Some(impact);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Text used wherever a one-line rendering is needed; falls back to the
    /// content when no summary was extracted.
    pub fn display_text(&self) -> &str {
        if self.summary.trim().is_empty() {
            &self.content
        } else {
            &self.summary
        }
    }

    /// Check the schema invariants of a memory record.
    pub fn validate(&self) -> Result<(), MnemoError> {
        if self.workspace_id.trim().is_empty() {
            return Err(MnemoError::InvalidMemory("workspace_id is empty".into()));
        }
        if self.content.trim().is_empty() {
            return Err(MnemoError::InvalidMemory("content is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.importance_score) {
            return Err(MnemoError::InvalidMemory(format!(
                "importance_score {} is outside [0, 1]",
                self.importance_score
            )));
        }
        if let Some(embedding) = &self.embedding {
            if embedding.is_empty() {
                return Err(MnemoError::InvalidMemory("embedding is empty".into()));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TriggerRule
// ─────────────────────────────────────────────────────────────────────────────

fn default_trigger_limit() -> usize {
    3
}

/// A keyword family mapped to a canned recall query.  Loaded once at startup
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub name: String,
    /// Lower-cased keywords; any substring hit fires the rule.
    pub keywords: BTreeSet<String>,
    pub memory_query: String,
    #[serde(default)]
    pub min_importance: f64,
    #[serde(default)]
    pub protection_level_filter: Option<ProtectionLevel>,
    #[serde(default = "default_trigger_limit")]
    pub limit: usize,
}

impl TriggerRule {
    pub fn new<I, S>(name: impl Into<String>, keywords: I, memory_query: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            memory_query: memory_query.into(),
            min_importance: 0.0,
            protection_level_filter: None,
            limit: default_trigger_limit(),
        }
    }

    pub fn with_min_importance(mut self, min_importance: f64) -> Self {
        self.min_importance = min_importance;
        self
    }

    pub fn with_protection_filter(mut self, level: ProtectionLevel) -> Self {
        self.protection_level_filter = Some(level);
        self
    }

    /// Keywords of this rule contained in `lowered_message`, in sorted order.
    ///
    /// The caller lower-cases the message once for all rules.
    pub fn matched_keywords(&self, lowered_message: &str) -> Vec<String> {
        self.keywords
            .iter()
            .filter(|k| lowered_message.contains(k.to_lowercase().as_str()))
            .cloned()
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pattern
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    RepeatedLesson,
    RegimeProfileCorrelation,
    FailureMode,
}

/// A detected statistical regularity.  Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_type: PatternType,
    pub description: String,
    pub evidence_count: usize,
    pub confidence: f64,
    pub supporting_memory_ids: Vec<Uuid>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rule
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Entry,
    Exit,
    Risk,
    PositionSizing,
    General,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Entry => "entry",
            RuleType::Exit => "exit",
            RuleType::Risk => "risk",
            RuleType::PositionSizing => "position_sizing",
            RuleType::General => "general",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = MnemoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(RuleType::Entry),
            "exit" => Ok(RuleType::Exit),
            "risk" => Ok(RuleType::Risk),
            "position_sizing" => Ok(RuleType::PositionSizing),
            "general" => Ok(RuleType::General),
            other => Err(MnemoError::InvalidMemory(format!("unknown rule type '{other}'"))),
        }
    }
}

/// A durable trading rule promoted from a sufficiently evidenced pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub workspace_id: String,
    pub content: String,
    pub rule_type: RuleType,
    pub confidence: f64,
    pub supporting_memory_ids: Vec<Uuid>,
    pub success_count: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Daemon events
// ─────────────────────────────────────────────────────────────────────────────

/// Notifications emitted by the memory daemon to its listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum DaemonEvent {
    MemoriesExtracted { count: usize, session_id: String },
    Error(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Error taxonomy
// ─────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every component of the engine.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MnemoError {
    #[error("Memory store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Embedding capability unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Recall cache entry corrupted: {0}")]
    CacheCorruption(String),

    #[error("Concurrent promotion for rule family: {0}")]
    PromotionConflict(String),

    #[error("Memory extraction failed: {0}")]
    DaemonExtractionFailure(String),

    #[error("Invalid memory: {0}")]
    InvalidMemory(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_level_serializes_as_integer() {
        let json = serde_json::to_string(&ProtectionLevel::Protected).unwrap();
        assert_eq!(json, "1");
        let back: ProtectionLevel = serde_json::from_str("3").unwrap();
        assert_eq!(back, ProtectionLevel::Ephemeral);
    }

    #[test]
    fn protection_level_rejects_out_of_range() {
        assert!(serde_json::from_str::<ProtectionLevel>("4").is_err());
        assert!(matches!(
            ProtectionLevel::try_from(9),
            Err(MnemoError::InvalidMemory(_))
        ));
    }

    #[test]
    fn protection_levels_order_by_criticality() {
        assert!(ProtectionLevel::Immutable < ProtectionLevel::Protected);
        assert!(ProtectionLevel::Standard < ProtectionLevel::Ephemeral);
        assert_eq!(ProtectionLevel::Immutable.recall_interval(), TimeDelta::days(3));
        assert_eq!(ProtectionLevel::Protected.recall_interval(), TimeDelta::days(7));
        assert_eq!(ProtectionLevel::Standard.recall_interval(), TimeDelta::days(30));
        assert_eq!(ProtectionLevel::Ephemeral.recall_interval(), TimeDelta::days(90));
    }

    #[test]
    fn new_memory_is_valid_and_never_recalled() {
        let m = Memory::new("ws", MemoryType::Lesson, "Cut losers early", "cut losers");
        assert!(m.validate().is_ok());
        assert!(m.last_recalled_at.is_none());
        assert_eq!(m.protection_level, ProtectionLevel::Standard);
    }

    #[test]
    fn importance_outside_unit_interval_is_invalid() {
        let high = Memory::new("ws", MemoryType::Fact, "x", "x").with_importance(1.2);
        let low = Memory::new("ws", MemoryType::Fact, "x", "x").with_importance(-0.1);
        assert!(matches!(high.validate(), Err(MnemoError::InvalidMemory(_))));
        assert!(matches!(low.validate(), Err(MnemoError::InvalidMemory(_))));
    }

    #[test]
    fn empty_workspace_is_invalid() {
        let m = Memory::new("  ", MemoryType::Fact, "x", "x");
        assert!(m.validate().is_err());
    }

    #[test]
    fn display_text_falls_back_to_content() {
        let m = Memory::new("ws", MemoryType::Fact, "full content", "");
        assert_eq!(m.display_text(), "full content");
    }

    #[test]
    fn memory_type_parses_case_insensitively() {
        assert_eq!("Lesson".parse::<MemoryType>().unwrap(), MemoryType::Lesson);
        assert!("opinion".parse::<MemoryType>().is_err());
    }

    #[test]
    fn trigger_rule_normalises_keywords_and_matches_substrings() {
        let rule = TriggerRule::new("risk", ["Drawdown", " stop loss ", ""], "risk lessons");
        assert_eq!(rule.keywords.len(), 2);
        let hits = rule.matched_keywords("the max drawdown was ugly");
        assert_eq!(hits, vec!["drawdown".to_string()]);
        assert!(rule.matched_keywords("all good").is_empty());
    }

    #[test]
    fn daemon_event_roundtrip() {
        let event = DaemonEvent::MemoriesExtracted {
            count: 2,
            session_id: "s-1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("memories-extracted"));
        let back: DaemonEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn mnemo_error_display() {
        let err = MnemoError::StoreUnavailable("sqlite locked".into());
        assert!(err.to_string().contains("sqlite locked"));
        assert_eq!(MnemoError::Timeout(250).to_string(), "Operation timed out after 250 ms");
    }
}
