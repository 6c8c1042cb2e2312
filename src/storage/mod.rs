//! In-memory SQLite database persisted as one encrypted file, with schema
//! migrations and one-time legacy plaintext conversion.

pub mod encrypted;
pub mod engine;
pub mod flush;
pub mod legacy;
pub mod migrator;
pub mod paths;
pub mod retry;
pub mod schema;

pub use encrypted::DatabaseFile;
pub use engine::{Database, EngineOptions, FlushStats, LoadSource, StartupReport};
pub use flush::FlushScheduler;
pub use legacy::{classify, cleanup_artifacts, LegacyMigrator, MigrationReport, MigrationState, MigrationStatus};
pub use migrator::SchemaMigrator;
pub use paths::DataPaths;
pub use schema::TableSchema;
