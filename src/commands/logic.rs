//! Pure decision functions extracted from the command handlers.
//!
//! These take plain parameters (no engine, no store) and can be unit-tested
//! in isolation.

use std::time::Duration;

use crate::config::PortsConfig;
use crate::core::{AppRule, ProtocolClass, Transport};
use crate::error::AppError;

/// Default class for a transport when none is given.
fn default_class(transport: Transport) -> ProtocolClass {
    match transport {
        Transport::Onion => ProtocolClass::Trans,
        Transport::Overlay => ProtocolClass::Udp,
    }
}

/// Default proxy port for a transport/class pair, if there is a sensible one.
fn default_port(transport: Transport, class: ProtocolClass, ports: &PortsConfig) -> Option<u16> {
    match (transport, class) {
        (Transport::Onion, ProtocolClass::Trans) => Some(ports.onion_trans),
        (Transport::Overlay, ProtocolClass::Udp) => Some(ports.overlay_udp),
        _ => None,
    }
}

/// Build a new rule, filling unset fields from the configured ports.
pub fn build_rule(
    uid: u32,
    package_name: &str,
    transport: Option<Transport>,
    target_port: Option<u16>,
    protocol_class: Option<ProtocolClass>,
    ports: &PortsConfig,
) -> Result<AppRule, AppError> {
    if package_name.trim().is_empty() {
        return Err(AppError::InvalidInput("package name must not be empty".into()));
    }
    let transport = transport.unwrap_or(Transport::Onion);
    let class = protocol_class.unwrap_or_else(|| default_class(transport));
    let port = target_port
        .or_else(|| default_port(transport, class, ports))
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "no default port for {class} over {transport}; pass --port"
            ))
        })?;
    let rule = AppRule::new(uid, package_name.trim(), transport, port, class);
    rule.validate()?;
    Ok(rule)
}

/// Apply the given changes on top of an existing rule.
pub fn merge_rule_update(
    existing: &AppRule,
    transport: Option<Transport>,
    target_port: Option<u16>,
    protocol_class: Option<ProtocolClass>,
) -> Result<AppRule, AppError> {
    if transport.is_none() && target_port.is_none() && protocol_class.is_none() {
        return Err(AppError::InvalidInput("nothing to update".into()));
    }
    let mut rule = existing.clone();
    if let Some(transport) = transport {
        rule.transport = transport;
    }
    if let Some(port) = target_port {
        rule.target_port = port;
    }
    if let Some(class) = protocol_class {
        rule.protocol_class = class;
    }
    rule.validate()?;
    Ok(rule)
}

/// Turning the policy off sends every application straight to the network.
pub fn validate_master_disable(confirmed: bool) -> Result<(), AppError> {
    if !confirmed {
        return Err(AppError::InvalidInput(
            "disabling the policy routes all applications around the anonymity network; \
             confirm with --yes"
                .into(),
        ));
    }
    Ok(())
}

/// Bypass duration in minutes, defaulting to the configured grace time.
pub fn resolve_bypass_duration(minutes: Option<u64>, default_minutes: u64) -> Result<Duration, AppError> {
    let minutes = minutes.unwrap_or(default_minutes);
    if minutes == 0 {
        return Err(AppError::InvalidInput("bypass duration must be positive".into()));
    }
    Ok(Duration::from_secs(minutes * 60))
}

/// `m:ss` rendering of a countdown.
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}
