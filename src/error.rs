//! Unified error type for the rule store, the policy engine and the command layer.
//!
//! `AppError` is the single error type returned by every command handler.
//! It serializes as `{ "kind": "...", "message": "..." }` so a front end can
//! programmatically distinguish error categories (and snap a toggle back).

use serde::ser::SerializeStruct;

/// Application-level error returned by store, engine and command operations.
///
/// Each variant maps to a distinct failure domain. Callers receive a JSON
/// object with `kind` (variant name) and `message` (human-readable description).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A rule with the same uid already exists. Recoverable: use update instead.
    #[error("{0}")]
    ConstraintViolation(String),

    /// The addressed rule or designated application does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Root access was not granted. Fatal to any policy application.
    #[error("{0}")]
    PrivilegeDenied(String),

    /// A privileged packet-filter command exited non-zero.
    #[error("{0}")]
    CommandFailed(String),

    /// The packet-filter binary is missing on this device.
    #[error("{0}")]
    CapabilityMissing(String),

    /// Errors originating from SQLite / database operations.
    #[error("{0}")]
    Database(String),

    /// I/O and OS-level errors (filesystem, process spawning).
    #[error("{0}")]
    Io(String),

    /// Invalid or missing user input.
    #[error("{0}")]
    InvalidInput(String),

    /// Unreadable or inconsistent configuration.
    #[error("{0}")]
    Config(String),

    /// The bypass countdown could not be armed.
    #[error("{0}")]
    Scheduler(String),
}

impl AppError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConstraintViolation(_) => "ConstraintViolation",
            AppError::NotFound(_) => "NotFound",
            AppError::PrivilegeDenied(_) => "PrivilegeDenied",
            AppError::CommandFailed(_) => "CommandFailed",
            AppError::CapabilityMissing(_) => "CapabilityMissing",
            AppError::Database(_) => "Database",
            AppError::Io(_) => "Io",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::Config(_) => "Config",
            AppError::Scheduler(_) => "Scheduler",
        }
    }

    pub fn command_failed(command: &str, code: i32) -> Self {
        AppError::CommandFailed(format!("`{command}` exited with status {code}"))
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Io(format!("{err:#}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => {
                AppError::ConstraintViolation(err.to_string())
            }
            _ => AppError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}
