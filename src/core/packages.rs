//! Installed-package lookup for legacy migration and onion client detection.

use std::collections::HashSet;
use std::path::PathBuf;

/// Answers whether an application package is currently installed.
pub trait PackageRegistry: Send + Sync {
    fn is_installed(&self, package: &str) -> bool;
}

/// Registry backed by the platform's `packages.list` file.
///
/// Each line starts with the package name followed by its uid; the file is
/// re-read on every lookup so freshly installed packages are seen.
pub struct PackagesList {
    path: PathBuf,
}

impl PackagesList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Every package name listed in the file; empty when it cannot be read.
    pub fn installed(&self) -> HashSet<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => parse_packages_list(&text),
            Err(e) => {
                tracing::warn!("Cannot read package list {}: {e}", self.path.display());
                HashSet::new()
            }
        }
    }
}

impl PackageRegistry for PackagesList {
    fn is_installed(&self, package: &str) -> bool {
        self.installed().contains(package)
    }
}

fn parse_packages_list(text: &str) -> HashSet<String> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}
