//! Migration of rules kept in the old flat-preferences format.

use std::collections::{BTreeMap, HashMap};

use super::RuleStore;
use crate::config;
use crate::core::{AppRule, PackageRegistry, ProtocolClass, Transport};
use crate::error::AppError;

/// Parse the legacy payload: a JSON array of single-entry `{package: uid}` objects.
pub fn parse_legacy_payload(json: &str) -> Result<BTreeMap<String, u32>, AppError> {
    let entries: Vec<HashMap<String, u32>> = serde_json::from_str(json)?;
    let mut pairs = BTreeMap::new();
    for entry in entries {
        if entry.len() != 1 {
            return Err(AppError::InvalidInput(format!(
                "legacy entry must map exactly one package to a uid, got {} keys",
                entry.len()
            )));
        }
        pairs.extend(entry);
    }
    Ok(pairs)
}

impl RuleStore {
    /// Import legacy `{package: uid}` pairs as transparent onion rules.
    ///
    /// Packages that are no longer installed are skipped silently, as are
    /// uids that already have a rule. Returns the number of rules added.
    pub fn import_legacy(
        &self,
        pairs: &BTreeMap<String, u32>,
        registry: &dyn PackageRegistry,
    ) -> Result<usize, AppError> {
        let mut imported = 0;
        for (package, &uid) in pairs {
            if !registry.is_installed(package) {
                tracing::debug!("Skipping legacy rule for {package}: not installed");
                continue;
            }
            let rule = AppRule::new(
                uid,
                package.as_str(),
                Transport::Onion,
                config::ONION_TRANS_PORT,
                ProtocolClass::Trans,
            );
            match self.add(&rule) {
                Ok(true) => imported += 1,
                Ok(false) => {}
                Err(AppError::ConstraintViolation(_)) => {
                    tracing::debug!("Skipping legacy rule for {package}: uid {uid} already stored");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!("Imported {imported}/{} legacy rules", pairs.len());
        Ok(imported)
    }
}
