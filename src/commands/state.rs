//! Shared application state handed to every command handler.

use std::sync::Arc;

use crate::config::Config;
use crate::core::PackageRegistry;
use crate::db::RuleStore;
use crate::error::AppError;
use crate::firewall::{PolicyEngine, PrivilegedExecutor};

pub struct AppState {
    pub config: Config,
    pub store: Arc<RuleStore>,
    pub engine: Arc<PolicyEngine>,
    /// Installed-package lookup used by the legacy import and capability detection.
    pub registry: Arc<dyn PackageRegistry>,
}

impl AppState {
    pub fn open(
        config: Config,
        executor: Arc<dyn PrivilegedExecutor>,
        registry: Arc<dyn PackageRegistry>,
    ) -> Result<Self, AppError> {
        let db_path = config.rules_db_path();
        let store = Arc::new(RuleStore::open(&db_path)?);
        tracing::debug!("Rule store opened at {}", db_path.display());
        let engine = PolicyEngine::new(
            Arc::clone(&store),
            executor,
            Arc::clone(&registry),
            config.clone(),
        )?;
        Ok(Self {
            config,
            store,
            engine,
            registry,
        })
    }
}
