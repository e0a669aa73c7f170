//! SQLite persistence layer for per-application rules.
//!
//! Uses `rusqlite` with bundled SQLite. Every operation opens its own
//! connection, performs one action and drops it again; no handle outlives a
//! call, so concurrent writers are serialized by SQLite's own locking.
//!
//! - `rules`: CRUD over the `app_rules` table
//! - `legacy`: migration of the old flat `{package: uid}` preference format

mod legacy;
mod rules;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use crate::config;
use crate::error::AppError;

pub use legacy::parse_legacy_payload;

/// Repository of [`AppRule`](crate::core::AppRule) records keyed by uid.
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    /// Open or create the rule database at the given path.
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            path: path.to_path_buf(),
        };

        let conn = store.connect()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS app_rules (
                app_uid INTEGER NOT NULL UNIQUE,
                app_name TEXT NOT NULL,
                transport TEXT NOT NULL,
                target_port INTEGER NOT NULL,
                protocol_class TEXT NOT NULL
            );
            ",
        )?;

        // WAL lets readers proceed while a reconciliation writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        tracing::debug!("Rule store ready at {}", path.display());
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_millis(config::STORE_BUSY_TIMEOUT_MS))?;
        Ok(conn)
    }
}
