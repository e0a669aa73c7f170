//! Rule table CRUD operations.

use rusqlite::{params, OptionalExtension};

use super::RuleStore;
use crate::core::AppRule;
use crate::error::AppError;

const SELECT_COLUMNS: &str =
    "SELECT app_uid, app_name, transport, target_port, protocol_class FROM app_rules";

impl RuleStore {
    /// True iff exactly one rule is stored for `uid`.
    pub fn exists(&self, uid: u32) -> Result<bool, AppError> {
        let conn = self.connect()?;
        let matches: i64 = conn.query_row(
            "SELECT COUNT(*) FROM app_rules WHERE app_uid = ?1",
            params![uid],
            |row| row.get(0),
        )?;
        if matches > 1 {
            tracing::error!("Rule store holds {matches} rows for uid {uid}");
            return Err(AppError::Database(format!(
                "uniqueness violated: {matches} rules stored for uid {uid}"
            )));
        }
        Ok(matches == 1)
    }

    /// Insert a new rule. A uid that is already stored fails with
    /// `ConstraintViolation`; use [`update`](Self::update) for those.
    pub fn add(&self, rule: &AppRule) -> Result<bool, AppError> {
        rule.validate()?;
        let conn = self.connect()?;
        let inserted = conn
            .execute(
                "INSERT INTO app_rules (app_uid, app_name, transport, target_port, protocol_class)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rule.uid,
                    rule.package_name,
                    rule.transport,
                    rule.target_port,
                    rule.protocol_class,
                ],
            )
            .map_err(|e| match AppError::from(e) {
                AppError::ConstraintViolation(_) => AppError::ConstraintViolation(format!(
                    "uid {} already has a rule; update it instead",
                    rule.uid
                )),
                other => other,
            })?;
        Ok(inserted == 1)
    }

    /// Replace the rule stored for `rule.uid`.
    ///
    /// Returns `false` when nothing matched. Constraint failures are logged
    /// and reported as `false` rather than as an error.
    pub fn update(&self, rule: &AppRule) -> Result<bool, AppError> {
        rule.validate()?;
        let conn = self.connect()?;
        let result = conn.execute(
            "UPDATE app_rules
             SET app_name = ?2, transport = ?3, target_port = ?4, protocol_class = ?5
             WHERE app_uid = ?1",
            params![
                rule.uid,
                rule.package_name,
                rule.transport,
                rule.target_port,
                rule.protocol_class,
            ],
        );
        match result.map_err(AppError::from) {
            Ok(changed) => Ok(changed == 1),
            Err(AppError::ConstraintViolation(msg)) => {
                tracing::error!("Constraint failure updating uid {}: {msg}", rule.uid);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the rule for `uid`; true iff exactly one row was removed.
    pub fn remove(&self, uid: u32) -> Result<bool, AppError> {
        let conn = self.connect()?;
        let deleted = conn.execute("DELETE FROM app_rules WHERE app_uid = ?1", params![uid])?;
        Ok(deleted == 1)
    }

    pub fn get(&self, uid: u32) -> Result<Option<AppRule>, AppError> {
        let conn = self.connect()?;
        let rule = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE app_uid = ?1"),
                params![uid],
                map_rule_row,
            )
            .optional()?;
        if rule.is_none() {
            tracing::debug!("No rule stored for uid {uid}");
        }
        Ok(rule)
    }

    /// Every stored rule, in no particular order.
    pub fn get_all(&self) -> Result<Vec<AppRule>, AppError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(SELECT_COLUMNS)?;
        let rows = stmt.query_map([], map_rule_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count(&self) -> Result<usize, AppError> {
        let conn = self.connect()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM app_rules", [], |row| row.get(0))?;
        Ok(total as usize)
    }
}

fn map_rule_row(row: &rusqlite::Row) -> rusqlite::Result<AppRule> {
    Ok(AppRule {
        uid: row.get(0)?,
        package_name: row.get(1)?,
        transport: row.get(2)?,
        target_port: row.get(3)?,
        protocol_class: row.get(4)?,
    })
}
