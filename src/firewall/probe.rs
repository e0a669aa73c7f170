//! Device capability detection.
//!
//! Pure detection: the only packet-filter state touched is the temporary
//! probe chain, which is flushed and deleted again.

use std::path::{Path, PathBuf};

use super::ruleset::RuleSet;
use super::PrivilegedExecutor;
use crate::config::Config;
use crate::core::PackageRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub root_available: bool,
    pub filter_binary: Option<PathBuf>,
    pub comment_annotations_supported: bool,
    pub init_script_installed: bool,
    pub onion_client_installed: bool,
    /// The filter chain is hooked into `OUTPUT`; false after a reboot.
    pub chains_hooked: bool,
}

pub fn detect(
    executor: &dyn PrivilegedExecutor,
    config: &Config,
    registry: &dyn PackageRegistry,
) -> ProbeReport {
    let root_available = check_root(executor);
    let filter_binary = find_filter_binary(&config.paths.filter_binaries);
    let (comment_annotations_supported, chains_hooked) = match (&filter_binary, root_available) {
        (Some(binary), true) => {
            let ruleset = RuleSet::new(binary.display().to_string(), false, config);
            (check_comments(executor, &ruleset), check_hooked(executor, &ruleset))
        }
        _ => (false, false),
    };
    let init_script_installed = config.paths.init_script.is_file();
    let onion_client_installed = registry.is_installed(&config.daemons.onion_package);
    if !onion_client_installed {
        tracing::warn!("Onion client {} is not installed", config.daemons.onion_package);
    }

    ProbeReport {
        root_available,
        filter_binary,
        comment_annotations_supported,
        init_script_installed,
        onion_client_installed,
        chains_hooked,
    }
}

/// Root is available when a trivial command succeeds through the executor.
pub fn check_root(executor: &dyn PrivilegedExecutor) -> bool {
    match executor.execute(&["id".to_string()]) {
        Ok(codes) => codes.first() == Some(&0),
        Err(e) => {
            tracing::warn!("Root check failed: {e:#}");
            false
        }
    }
}

pub fn find_filter_binary(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| Path::new(p).is_file()).cloned()
}

pub fn check_comments(executor: &dyn PrivilegedExecutor, ruleset: &RuleSet) -> bool {
    let lines = ruleset.comment_probe();
    match executor.execute(&lines) {
        Ok(codes) => {
            if codes.get(2..).is_some_and(|cleanup| cleanup.iter().any(|c| *c != 0)) {
                tracing::warn!("Comment probe chain cleanup failed: {codes:?}");
            }
            codes.get(1) == Some(&0)
        }
        Err(e) => {
            tracing::warn!("Comment probe failed: {e:#}");
            false
        }
    }
}

pub fn check_hooked(executor: &dyn PrivilegedExecutor, ruleset: &RuleSet) -> bool {
    match executor.execute(&[ruleset.hook_check()]) {
        Ok(codes) => codes.first() == Some(&0),
        Err(e) => {
            tracing::warn!("Hook check failed: {e:#}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::test_support::SimulatedFilter;

    fn registry(installed: &[&str]) -> HashSet<String> {
        installed.iter().map(|p| p.to_string()).collect()
    }

    fn config_with_binary(dir: &Path) -> Config {
        let binary = dir.join("iptables");
        std::fs::write(&binary, "").unwrap();
        let mut config = Config::default();
        config.paths.filter_binaries = vec![dir.join("missing"), binary];
        config.paths.init_script = dir.join("91onionwall");
        config
    }

    #[test]
    fn test_detect_full_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_binary(dir.path());
        std::fs::write(&config.paths.init_script, "#!/system/bin/sh\n").unwrap();
        let filter = SimulatedFilter::new();

        let report = detect(&filter, &config, &registry(&["org.torproject.android"]));

        assert!(report.root_available);
        assert_eq!(report.filter_binary, Some(dir.path().join("iptables")));
        assert!(report.comment_annotations_supported);
        assert!(report.init_script_installed);
        assert!(report.onion_client_installed);
        assert!(!report.chains_hooked);
        // The probe chain is gone again.
        assert!(!filter.has_chain("filter", "ow_probe"));
    }

    #[test]
    fn test_detect_kernel_without_comment_match() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_binary(dir.path());
        let filter = SimulatedFilter::new().without_comments();

        let report = detect(&filter, &config, &registry(&[]));

        assert!(report.root_available);
        assert!(!report.comment_annotations_supported);
        assert!(!report.init_script_installed);
        assert!(!filter.has_chain("filter", "ow_probe"));
    }

    #[test]
    fn test_no_root_skips_comment_probe() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_binary(dir.path());
        let filter = SimulatedFilter::new().without_root();

        let report = detect(&filter, &config, &registry(&[]));

        assert!(!report.root_available);
        assert!(!report.comment_annotations_supported);
        assert!(!report.chains_hooked);
        assert_eq!(filter.log(), vec!["id".to_string()]);
    }

    #[test]
    fn test_onion_client_package_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_binary(dir.path());
        config.daemons.onion_package = "org.example.onion".into();
        let filter = SimulatedFilter::new();

        assert!(!detect(&filter, &config, &registry(&["org.torproject.android"])).onion_client_installed);
        assert!(detect(&filter, &config, &registry(&["org.example.onion"])).onion_client_installed);
    }

    #[test]
    fn test_hooked_chain_detected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_binary(dir.path());
        let filter = SimulatedFilter::new();
        let binary = dir.path().join("iptables").display().to_string();
        let rs = RuleSet::new(binary, false, &config);
        filter.execute(&rs.ensure_and_flush()).unwrap();

        assert!(detect(&filter, &config, &registry(&[])).chains_hooked);
    }

    #[test]
    fn test_missing_binary() {
        assert_eq!(
            find_filter_binary(&[PathBuf::from("/nonexistent/iptables")]),
            None
        );
    }
}
