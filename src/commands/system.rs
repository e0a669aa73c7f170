//! Capability, master switch, toggle and captive-bypass commands.

use std::time::Duration;

use serde::Serialize;

use crate::core::Capabilities;
use crate::error::AppError;
use crate::services::wait;

use super::logic::{resolve_bypass_duration, validate_master_disable};
use super::state::AppState;

/// Snapshot printed by `onionwall status`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub capabilities: Capabilities,
    pub master_enabled: bool,
    /// Master on and the device can actually apply rules.
    pub active: bool,
    /// The owned chains currently hold the full policy.
    pub policy_applied: bool,
    pub lan_bypass_enabled: bool,
    pub tether_enabled: bool,
    pub sip_enabled: bool,
    pub designated_browser_uid: Option<u32>,
    pub designated_sip_uid: Option<u32>,
    pub captive_bypass_uid: Option<u32>,
    /// Unix time at which the exemption lapses.
    pub captive_bypass_until: Option<u64>,
    pub rule_count: usize,
}

/// Which designated application a `designate` call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Designation {
    Browser,
    Sip,
}

// ---- Capabilities & status ----

pub fn initialize(state: &AppState) -> Result<Capabilities, AppError> {
    state.engine.initialize()
}

pub fn status(state: &AppState) -> Result<Status, AppError> {
    let policy = state.engine.state();
    Ok(Status {
        capabilities: policy.capabilities(),
        master_enabled: policy.master_enabled,
        active: policy.is_active(),
        policy_applied: policy.policy_applied,
        lan_bypass_enabled: policy.lan_bypass_enabled,
        tether_enabled: policy.tether_enabled,
        sip_enabled: policy.sip_enabled,
        designated_browser_uid: policy.designated_browser_uid,
        designated_sip_uid: policy.designated_sip_uid,
        captive_bypass_uid: policy.captive_bypass_uid,
        captive_bypass_until: policy.captive_bypass_until,
        rule_count: state.store.count()?,
    })
}

// ---- Policy application ----

/// The command batch a full reconciliation would run.
pub fn plan_policy(state: &AppState) -> Result<Vec<String>, AppError> {
    state.engine.plan_full_policy()
}

pub fn apply_policy(state: &AppState) -> Result<(), AppError> {
    state.engine.apply_with_retry()
}

pub fn set_master_enabled(state: &AppState, enable: bool, confirmed: bool) -> Result<(), AppError> {
    if !enable {
        validate_master_disable(confirmed)?;
    }
    state.engine.set_master_enabled(enable)
}

// ---- Toggles ----

pub fn toggle_lan(state: &AppState, enable: bool) -> Result<(), AppError> {
    state.engine.toggle_lan(enable)
}

/// Blocks until the policy worker has applied the forwarding rules.
pub fn toggle_tether(state: &AppState, enable: bool) -> Result<(), AppError> {
    wait(state.engine.toggle_tether(enable))
}

/// Toggle SIP redirection for `uid`, or for the designated SIP application.
pub fn toggle_sip(state: &AppState, enable: bool, uid: Option<u32>) -> Result<u32, AppError> {
    let uid = uid
        .or(state.engine.state().designated_sip_uid)
        .ok_or_else(|| AppError::NotFound("no SIP application designated".into()))?;
    state.engine.toggle_sip_redirect(uid, enable)?;
    Ok(uid)
}

pub fn designate(state: &AppState, role: Designation, uid: Option<u32>) -> Result<(), AppError> {
    match role {
        Designation::Browser => state.engine.designate_browser(uid)?,
        Designation::Sip => state.engine.designate_sip(uid)?,
    }
    match uid {
        Some(uid) => tracing::info!("Designated {role:?} uid {uid}"),
        None => tracing::info!("Cleared {role:?} designation"),
    }
    Ok(())
}

// ---- Captive portal bypass ----

/// Exempt the designated browser for `minutes` (default: configured grace time).
///
/// Must run inside a tokio runtime; the countdown lives on it.
pub fn start_captive_bypass(state: &AppState, minutes: Option<u64>) -> Result<(u32, Duration), AppError> {
    let uid = state
        .engine
        .state()
        .designated_browser_uid
        .ok_or_else(|| AppError::NotFound("no browser designated for captive portal login".into()))?;
    let duration = resolve_bypass_duration(minutes, state.config.bypass.grace_minutes)?;
    state.engine.arm_captive_bypass(uid, duration)?;
    Ok((uid, duration))
}

/// Revert the current exemption, if any. Returns the uid that was exempted.
pub fn stop_captive_bypass(state: &AppState) -> Result<Option<u32>, AppError> {
    let Some(uid) = state.engine.state().captive_bypass_uid else {
        return Ok(None);
    };
    state.engine.toggle_captive_bypass(uid, false)?;
    Ok(Some(uid))
}
