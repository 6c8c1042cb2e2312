//! SealDB: encrypted persistence core for a self-hosted server.
//!
//! Modular structure:
//! - [`crypto`]: Host fingerprint, system secrets, field cipher, per-user keys
//! - [`storage`]: In-memory database, encrypted file, migrations, flushing
//! - [`context`]: The explicitly constructed persistence context
//! - [`config`]: Defaults, JSON file and environment overrides
//! - [`logging`]: Structured JSON logging and audit lines

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::StoreConfig;
pub use context::{inspect_disk, DiskStatus, HealthStatus, PersistenceContext};
pub use crypto::{DataKey, FieldCipher, FieldPolicy, HardwareFingerprint, Record, SecretStore, UserDataCrypto};
pub use error::{Result, StoreError};
pub use logging::StructuredLogger;
pub use storage::{Database, FlushScheduler, SchemaMigrator, TableSchema};
