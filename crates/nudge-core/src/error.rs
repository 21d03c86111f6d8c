//! Error types for Nudge.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NudgeError>;

/// Errors raised by the follow-up engine and its surfaces.
///
/// Expected scheduling outcomes ("opted out", "already scheduled", ...) are
/// not errors and never travel through this type.
#[derive(Debug, Error)]
pub enum NudgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stored step delay cannot be turned into a run time.
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// A row was touched on behalf of a company that does not own it.
    #[error("Contact '{contact_id}' does not belong to company '{company_id}'")]
    TenantMismatch {
        contact_id: String,
        company_id: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NudgeError {
    /// Shorthand used by the storage layer's `map_err` calls.
    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }
}
