//! Trading rule persistence.
//!
//! Rules promoted by the pattern detector live in the `trading_rules` table
//! next to the memories that support them.  A rule is created once per
//! lesson family and afterwards only updated in place.

use mnemo_types::{Rule, RuleType};
use rusqlite::{Row, params};

use crate::error::StoreError;
use crate::local::{LocalStore, conversion_error, parse_ts, parse_uuid, ts_to_sql};

const RULE_COLUMNS: &str = "id, workspace_id, content, rule_type, confidence, \
     supporting_memory_ids, success_count, active, created_at, last_validated_at";

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let id: String = row.get(0)?;
    let rule_type: String = row.get(3)?;
    let supporting: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    let last_validated_at: String = row.get(9)?;
    Ok(Rule {
        id: parse_uuid(0, &id)?,
        workspace_id: row.get(1)?,
        content: row.get(2)?,
        rule_type: rule_type
            .parse::<RuleType>()
            .map_err(|e| conversion_error(3, e))?,
        confidence: row.get(4)?,
        supporting_memory_ids: serde_json::from_str(&supporting)
            .map_err(|e| conversion_error(5, e))?,
        success_count: row.get(6)?,
        active: row.get(7)?,
        created_at: parse_ts(8, &created_at)?,
        last_validated_at: parse_ts(9, &last_validated_at)?,
    })
}

fn supporting_json(rule: &Rule) -> Result<String, StoreError> {
    serde_json::to_string(&rule.supporting_memory_ids)
        .map_err(|e| StoreError::InvalidMemory(e.to_string()))
}

impl LocalStore {
    /// Persist a new rule.
    pub fn insert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let supporting = supporting_json(rule)?;
        self.lock()?.execute(
            &format!(
                "INSERT INTO trading_rules ({RULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                rule.id.to_string(),
                rule.workspace_id,
                rule.content,
                rule.rule_type.as_str(),
                rule.confidence,
                supporting,
                rule.success_count,
                rule.active,
                ts_to_sql(&rule.created_at),
                ts_to_sql(&rule.last_validated_at),
            ],
        )?;
        Ok(())
    }

    /// Overwrite the mutable fields of an existing rule.
    ///
    /// Returns [`StoreError::NotFound`] if no rule has `rule.id`.
    pub fn update_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let supporting = supporting_json(rule)?;
        let changed = self.lock()?.execute(
            "UPDATE trading_rules
             SET content = ?2, rule_type = ?3, confidence = ?4, supporting_memory_ids = ?5,
                 success_count = ?6, active = ?7, last_validated_at = ?8
             WHERE id = ?1",
            params![
                rule.id.to_string(),
                rule.content,
                rule.rule_type.as_str(),
                rule.confidence,
                supporting,
                rule.success_count,
                rule.active,
                ts_to_sql(&rule.last_validated_at),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(rule.id.to_string()));
        }
        Ok(())
    }

    /// All rules of `workspace_id`, oldest first.
    pub fn list_rules(&self, workspace_id: &str) -> Result<Vec<Rule>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM trading_rules
             WHERE workspace_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![workspace_id], row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn make_rule(ws: &str, content: &str) -> Rule {
        let now = Utc::now();
        Rule {
            id: Uuid::new_v4(),
            workspace_id: ws.to_string(),
            content: content.to_string(),
            rule_type: RuleType::Risk,
            confidence: 0.6,
            supporting_memory_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            success_count: 2,
            active: true,
            created_at: now,
            last_validated_at: now,
        }
    }

    #[test]
    fn insert_and_list_rules() {
        let store = LocalStore::open_in_memory().unwrap();
        let rule = make_rule("ws", "Cap risk at 1% per trade");
        store.insert_rule(&rule).unwrap();
        store.insert_rule(&make_rule("other", "elsewhere")).unwrap();

        let rules = store.list_rules("ws").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, rule.id);
        assert_eq!(rules[0].rule_type, RuleType::Risk);
        assert_eq!(rules[0].supporting_memory_ids, rule.supporting_memory_ids);
        assert!(rules[0].active);
    }

    #[test]
    fn update_rule_replaces_supporting_ids() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut rule = make_rule("ws", "Cap risk");
        store.insert_rule(&rule).unwrap();

        rule.supporting_memory_ids = vec![Uuid::new_v4()];
        rule.success_count = 1;
        store.update_rule(&rule).unwrap();

        let rules = store.list_rules("ws").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].supporting_memory_ids.len(), 1);
        assert_eq!(rules[0].success_count, 1);
    }

    #[test]
    fn update_unknown_rule_is_not_found() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = store.update_rule(&make_rule("ws", "ghost")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
