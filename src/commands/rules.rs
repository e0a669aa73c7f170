//! Per-application rule commands and the legacy import.

use std::path::Path;

use crate::core::{AppRule, ProtocolClass, Transport};
use crate::db;
use crate::error::AppError;

use super::logic::{build_rule, merge_rule_update};
use super::state::AppState;

pub fn add_rule(
    state: &AppState,
    uid: u32,
    package_name: &str,
    transport: Option<Transport>,
    target_port: Option<u16>,
    protocol_class: Option<ProtocolClass>,
) -> Result<AppRule, AppError> {
    let rule = build_rule(uid, package_name, transport, target_port, protocol_class, &state.config.ports)?;
    state.engine.add_rule(&rule)?;
    Ok(rule)
}

pub fn update_rule(
    state: &AppState,
    uid: u32,
    transport: Option<Transport>,
    target_port: Option<u16>,
    protocol_class: Option<ProtocolClass>,
) -> Result<AppRule, AppError> {
    let existing = show_rule(state, uid)?;
    let rule = merge_rule_update(&existing, transport, target_port, protocol_class)?;
    if !state.engine.update_rule(&rule)? {
        return Err(AppError::NotFound(format!("rule for uid {uid} was not updated")));
    }
    Ok(rule)
}

pub fn remove_rule(state: &AppState, uid: u32) -> Result<(), AppError> {
    if !state.engine.remove_rule(uid)? {
        return Err(AppError::NotFound(format!("no rule for uid {uid}")));
    }
    Ok(())
}

pub fn show_rule(state: &AppState, uid: u32) -> Result<AppRule, AppError> {
    state
        .store
        .get(uid)?
        .ok_or_else(|| AppError::NotFound(format!("no rule for uid {uid}")))
}

/// All rules, ascending by uid.
pub fn list_rules(state: &AppState) -> Result<Vec<AppRule>, AppError> {
    let mut rules = state.store.get_all()?;
    rules.sort_by_key(|r| r.uid);
    Ok(rules)
}

/// Import a legacy preferences dump; returns the number of rules added.
pub fn import_legacy(state: &AppState, file: &Path) -> Result<usize, AppError> {
    let payload = std::fs::read_to_string(file)
        .map_err(|e| AppError::Io(format!("cannot read {}: {e}", file.display())))?;
    let pairs = db::parse_legacy_payload(&payload)?;
    state.engine.import_legacy(&pairs, state.registry.as_ref())
}
