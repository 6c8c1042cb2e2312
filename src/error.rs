//! Error taxonomy for the persistence core.
//!
//! Startup-phase errors (secret initialization, initial load, legacy migration)
//! abort the process. Per-operation errors (one flush, one field decrypt) are
//! logged by the caller and degrade instead.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A required secret is missing or too short in a deployment that demands it.
    #[error("secret {name} could not be initialized: {reason}")]
    KeyInitialization { name: String, reason: String },

    /// The encrypted database file is bound to a different host.
    #[error("hardware fingerprint does not match the encrypted database binding")]
    HardwareMismatch,

    /// Ciphertext, tag or associated data did not verify.
    #[error("authentication failed: ciphertext, tag or associated data mismatch")]
    AuthenticationFailure,

    /// Row/table counts or foreign keys disagree after a legacy copy.
    #[error("migration verification failed: {0}")]
    MigrationVerification(String),

    /// Strict decrypt policy found a plaintext value in a sensitive column.
    #[error("field {table}.{field} is not encrypted")]
    UnencryptedField { table: String, field: String },

    #[error("invalid encrypted format: {0}")]
    InvalidFormat(String),

    #[error("schema migration failed: {0}")]
    Migration(String),

    /// A legacy plaintext migration aborted. The original file is untouched.
    #[error("legacy migration failed at {step}: {message} (backup: {backup_path:?}, after {elapsed:?})")]
    LegacyMigration {
        step: &'static str,
        message: String,
        backup_path: Option<PathBuf>,
        elapsed: Duration,
    },

    #[error("data key for user {0} is not unlocked")]
    UserLocked(String),

    #[error("record has sensitive fields but no id")]
    MissingRecordId,

    #[error("store is not initialized")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn key_init(name: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::KeyInitialization {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that mean "this file is not usable here", as opposed to
    /// I/O trouble reaching it.
    pub fn is_unreadable_file(&self) -> bool {
        matches!(
            self,
            StoreError::HardwareMismatch
                | StoreError::AuthenticationFailure
                | StoreError::InvalidFormat(_)
        )
    }
}
