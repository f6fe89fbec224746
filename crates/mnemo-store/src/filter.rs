//! [`MemoryFilter`] – the query language of the memory store.
//!
//! A filter is always scoped to one workspace.  Every other facet is
//! optional and combined with `AND`.  The filter compiles to a parameterised
//! SQL `WHERE` clause for the local SQLite leg.

use chrono::{DateTime, Utc};
use mnemo_types::{MemoryType, ProtectionLevel};
use rusqlite::types::Value;

use crate::local::ts_to_sql;

/// Result ordering requested by the caller.  The store applies none unless
/// asked; `rowid` is always appended so equal keys come back in insertion
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOrder {
    CreatedAsc,
    CreatedDesc,
    ImportanceDesc,
    LastRecalledAsc,
}

/// Filter over the memories of a single workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryFilter {
    pub workspace_id: String,
    pub memory_types: Vec<MemoryType>,
    pub protection_level: Option<ProtectionLevel>,
    pub min_importance: Option<f64>,
    /// Matches memories never recalled or last recalled at or before the cutoff.
    pub stale_as_of: Option<DateTime<Utc>>,
    /// Matches memories last recalled at or after the given instant.
    pub recalled_since: Option<DateTime<Utc>>,
    pub never_recalled: bool,
    pub categories: Vec<String>,
    /// Matches memories carrying at least one of these tags (case-insensitive).
    pub tags_any: Vec<String>,
    pub negative_impact_only: bool,
    pub order: Option<MemoryOrder>,
    pub limit: Option<usize>,
    /// Rows skipped before the first returned one; pairs with `order` for paging.
    pub offset: Option<usize>,
}

impl MemoryFilter {
    pub fn workspace(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            memory_types: Vec::new(),
            protection_level: None,
            min_importance: None,
            stale_as_of: None,
            recalled_since: None,
            never_recalled: false,
            categories: Vec::new(),
            tags_any: Vec::new(),
            negative_impact_only: false,
            order: None,
            limit: None,
            offset: None,
        }
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_types.push(memory_type);
        self
    }

    pub fn memory_types(mut self, types: &[MemoryType]) -> Self {
        self.memory_types.extend_from_slice(types);
        self
    }

    pub fn protection_level(mut self, level: ProtectionLevel) -> Self {
        self.protection_level = Some(level);
        self
    }

    pub fn min_importance(mut self, min: f64) -> Self {
        self.min_importance = Some(min);
        self
    }

    pub fn stale_as_of(mut self, cutoff: DateTime<Utc>) -> Self {
        self.stale_as_of = Some(cutoff);
        self
    }

    pub fn recalled_since(mut self, since: DateTime<Utc>) -> Self {
        self.recalled_since = Some(since);
        self
    }

    pub fn never_recalled(mut self) -> Self {
        self.never_recalled = true;
        self
    }

    pub fn categories(mut self, categories: &[String]) -> Self {
        self.categories.extend(categories.iter().cloned());
        self
    }

    pub fn tags_any(mut self, tags: &[String]) -> Self {
        self.tags_any.extend(tags.iter().cloned());
        self
    }

    pub fn negative_impact_only(mut self) -> Self {
        self.negative_impact_only = true;
        self
    }

    pub fn order(mut self, order: MemoryOrder) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Compile into a `WHERE ... [ORDER BY ...] [LIMIT ...]` tail and its
    /// positional parameters.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses = vec!["workspace_id = ?".to_string()];
        let mut params = vec![Value::Text(self.workspace_id.clone())];

        if !self.memory_types.is_empty() {
            clauses.push(format!(
                "memory_type IN ({})",
                placeholders(self.memory_types.len())
            ));
            params.extend(
                self.memory_types
                    .iter()
                    .map(|t| Value::Text(t.as_str().to_string())),
            );
        }
        if let Some(level) = self.protection_level {
            clauses.push("protection_level = ?".into());
            params.push(Value::Integer(i64::from(level.as_u8())));
        }
        if let Some(min) = self.min_importance {
            clauses.push("importance_score >= ?".into());
            params.push(Value::Real(min));
        }
        if let Some(cutoff) = self.stale_as_of {
            clauses.push("(last_recalled_at IS NULL OR last_recalled_at <= ?)".into());
            params.push(Value::Text(ts_to_sql(&cutoff)));
        }
        if let Some(since) = self.recalled_since {
            clauses.push("last_recalled_at >= ?".into());
            params.push(Value::Text(ts_to_sql(&since)));
        }
        if self.never_recalled {
            clauses.push("last_recalled_at IS NULL".into());
        }
        if !self.categories.is_empty() {
            clauses.push(format!(
                "lower(category) IN ({})",
                placeholders(self.categories.len())
            ));
            params.extend(
                self.categories
                    .iter()
                    .map(|c| Value::Text(c.to_lowercase())),
            );
        }
        if !self.tags_any.is_empty() {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(memories.tags) \
                 WHERE lower(json_each.value) IN ({}))",
                placeholders(self.tags_any.len())
            ));
            params.extend(self.tags_any.iter().map(|t| Value::Text(t.to_lowercase())));
        }
        if self.negative_impact_only {
            clauses.push("financial_impact < 0".into());
        }

        let mut sql = format!(" WHERE {}", clauses.join(" AND "));
        if let Some(order) = self.order {
            sql.push_str(match order {
                MemoryOrder::CreatedAsc => " ORDER BY created_at ASC, rowid ASC",
                MemoryOrder::CreatedDesc => " ORDER BY created_at DESC, rowid DESC",
                MemoryOrder::ImportanceDesc => " ORDER BY importance_score DESC, rowid ASC",
                MemoryOrder::LastRecalledAsc => {
                    " ORDER BY last_recalled_at IS NOT NULL, last_recalled_at ASC, rowid ASC"
                }
            });
        }
        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
        if self.limit.is_some() || self.offset.is_some() {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(self.limit.map_or(-1, |l| l as i64)));
        }
        if let Some(offset) = self.offset {
            sql.push_str(" OFFSET ?");
            params.push(Value::Integer(offset as i64));
        }
        (sql, params)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
