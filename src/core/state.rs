//! Process-wide policy toggles and cached device capabilities.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Toggles and capability flags owned by the policy engine.
///
/// Persisted as JSON so the toggles and the last capability probe survive
/// across invocations. Only the engine mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyState {
    pub master_enabled: bool,
    pub lan_bypass_enabled: bool,
    pub tether_enabled: bool,
    pub sip_enabled: bool,
    pub designated_browser_uid: Option<u32>,
    pub designated_sip_uid: Option<u32>,
    /// uid currently exempted by the captive-portal bypass.
    pub captive_bypass_uid: Option<u32>,
    /// Unix time (seconds) at which the exemption lapses, whether or not the
    /// process running its countdown is still alive.
    pub captive_bypass_until: Option<u64>,
    /// The owned chains hold the full policy, so single groups can be
    /// inserted or deleted in place.
    pub policy_applied: bool,
    pub root_available: bool,
    pub filter_binary_present: bool,
    pub filter_binary: Option<PathBuf>,
    pub comment_annotations_supported: bool,
    pub init_script_installed: bool,
    pub onion_client_installed: bool,
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            master_enabled: true,
            lan_bypass_enabled: false,
            tether_enabled: false,
            sip_enabled: false,
            designated_browser_uid: None,
            designated_sip_uid: None,
            captive_bypass_uid: None,
            captive_bypass_until: None,
            policy_applied: false,
            root_available: false,
            filter_binary_present: false,
            filter_binary: None,
            comment_annotations_supported: false,
            init_script_installed: false,
            onion_client_installed: false,
        }
    }
}

/// Result of a capability probe, as shown on a status screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub root_available: bool,
    pub filter_binary_present: bool,
    pub comment_annotations_supported: bool,
    pub init_script_installed: bool,
    pub onion_client_installed: bool,
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

impl PolicyState {
    /// Load persisted state; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                AppError::Config(format!("corrupt state file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the state atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            root_available: self.root_available,
            filter_binary_present: self.filter_binary_present,
            comment_annotations_supported: self.comment_annotations_supported,
            init_script_installed: self.init_script_installed,
            onion_client_installed: self.onion_client_installed,
        }
    }

    /// The exempted uid, unless its window has lapsed at `now`.
    ///
    /// An exemption without a deadline is treated as lapsed.
    pub fn live_captive_uid(&self, now: u64) -> Option<u32> {
        match self.captive_bypass_until {
            Some(until) if until > now => self.captive_bypass_uid,
            _ => None,
        }
    }

    /// Whether policy rules are currently expected to be present in the kernel.
    pub fn is_active(&self) -> bool {
        self.master_enabled && self.root_available && self.filter_binary_present
    }
}
