//! Runtime constants and the TOML configuration file.
//!
//! Defaults are collected here so they can be found and adjusted in a single
//! place rather than scattered across modules. Every field of [`Config`] has
//! a default, so an empty file (or no file at all) is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Port the onion router's transparent proxy listens on.
pub const ONION_TRANS_PORT: u16 = 9040;

/// Port the onion router's DNS resolver listens on.
pub const ONION_DNS_PORT: u16 = 5400;

/// Port of the overlay network's datagram proxy (SIP redirection target).
pub const OVERLAY_UDP_PORT: u16 = 7655;

/// Default length of a captive-portal bypass window (minutes).
pub const BYPASS_GRACE_MINUTES: u64 = 5;

/// Interval between bypass countdown progress ticks (seconds).
pub const BYPASS_TICK_SECS: u64 = 30;

/// How long a store connection waits on a locked database (milliseconds).
pub const STORE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// File name of the rule database inside the data directory.
pub const RULES_DB_FILE: &str = "rules.db";

/// File name of the persisted policy state inside the data directory.
pub const STATE_FILE: &str = "state.json";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub ports: PortsConfig,

    #[serde(default)]
    pub daemons: DaemonsConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub privilege: PrivilegeConfig,

    #[serde(default)]
    pub bypass: BypassConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortsConfig {
    pub onion_trans: u16,
    pub onion_dns: u16,
    pub overlay_udp: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            onion_trans: ONION_TRANS_PORT,
            onion_dns: ONION_DNS_PORT,
            overlay_udp: OVERLAY_UDP_PORT,
        }
    }
}

/// Package name of the onion-routing client checked at capability detection.
pub const ONION_CLIENT_PACKAGE: &str = "org.torproject.android";

/// The transport daemons. Their uids' traffic is always let out.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonsConfig {
    pub onion_uid: Option<u32>,
    pub overlay_uid: Option<u32>,
    pub onion_package: String,
}

impl Default for DaemonsConfig {
    fn default() -> Self {
        Self {
            onion_uid: None,
            overlay_uid: None,
            onion_package: ONION_CLIENT_PACKAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    /// Candidate locations of the packet-filter binary, searched in order.
    pub filter_binaries: Vec<PathBuf>,
    /// Boot-time script that re-applies the policy; only its presence is checked.
    pub init_script: PathBuf,
    pub packages_list: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data/local/onionwall"),
            filter_binaries: vec![
                PathBuf::from("/system/bin/iptables"),
                PathBuf::from("/system/xbin/iptables"),
                PathBuf::from("/sbin/iptables"),
                PathBuf::from("/usr/sbin/iptables"),
            ],
            init_script: PathBuf::from("/data/local/userinit.d/91onionwall"),
            packages_list: PathBuf::from("/data/system/packages.list"),
        }
    }
}

/// Prefix prepended to every privileged command, e.g. `["su", "-c"]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    pub wrapper: Vec<String>,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            wrapper: vec!["su".to_string(), "-c".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BypassConfig {
    pub grace_minutes: u64,
    pub tick_secs: u64,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            grace_minutes: BYPASS_GRACE_MINUTES,
            tick_secs: BYPASS_TICK_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Destinations exempted from redirection when LAN bypass is on.
    pub lan_ranges: Vec<String>,
    /// Interfaces tethered clients arrive on.
    pub tether_interfaces: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            lan_ranges: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
            ],
            tether_interfaces: vec![
                "rndis0".to_string(),
                "wlan1".to_string(),
                "bt-pan".to_string(),
            ],
        }
    }
}

impl Config {
    /// Parse and validate a configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file from disk.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let ports = [
            ("ports.onion_trans", self.ports.onion_trans),
            ("ports.onion_dns", self.ports.onion_dns),
            ("ports.overlay_udp", self.ports.overlay_udp),
        ];
        for (name, port) in ports {
            if port == 0 {
                return Err(AppError::Config(format!("{name} must be a non-zero port")));
            }
        }
        if self.paths.filter_binaries.is_empty() {
            return Err(AppError::Config(
                "paths.filter_binaries must name at least one candidate".into(),
            ));
        }
        if self.bypass.grace_minutes == 0 {
            return Err(AppError::Config("bypass.grace_minutes must be positive".into()));
        }
        if self.bypass.tick_secs == 0 {
            return Err(AppError::Config("bypass.tick_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn rules_db_path(&self) -> PathBuf {
        self.paths.data_dir.join(RULES_DB_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.paths.data_dir.join(STATE_FILE)
    }
}
