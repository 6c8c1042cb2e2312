//! The live database: one SQLite connection held in memory, persisted as a
//! single encrypted file.
//!
//! Startup: load the encrypted file if there is one, otherwise migrate a legacy
//! plaintext file, otherwise start empty with the baseline schema. Every write
//! through [`Database::write`] requests a save; the flush scheduler does the rest.

use rusqlite::serialize::OwnedData;
use rusqlite::{Connection, DatabaseName};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::crypto::field::DataKey;
use crate::error::{Result, StoreError};
use crate::storage::encrypted::DatabaseFile;
use crate::storage::flush::SaveSignal;
use crate::storage::legacy::{LegacyMigrator, MigrationReport, MigrationState};
use crate::storage::paths::{artifact_timestamp, DataPaths, BACKUP_PREFIX, MIGRATED_PREFIX};
use crate::storage::retry::{remove_file_with_retry, RetryPolicy, Sleeper, ThreadSleeper};
use crate::storage::schema;

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub file_encryption: bool,
    pub required: bool,
    pub hardware_binding: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Encrypted,
    Migrated,
    Fresh,
    /// File encryption disabled; the plaintext file is opened directly
    PlaintextFile,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StartupReport {
    pub source: LoadSource,
    /// Why an existing encrypted file was not used
    pub fallback: Option<String>,
    pub quarantined: Option<PathBuf>,
    #[serde(skip)]
    pub legacy: Option<MigrationReport>,
    pub manual_intervention: bool,
    /// A plaintext file reappeared at the legacy path after classification
    /// and was removed
    pub residual_removed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FlushOutcome {
    pub bytes: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FlushStats {
    pub last_flush_at: Option<DateTime<Utc>>,
    pub flushes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

struct Persistence {
    file: DatabaseFile,
    path: PathBuf,
    key: DataKey,
    bind_hardware: bool,
}

pub struct Database {
    conn: Mutex<Connection>,
    persistence: Option<Persistence>,
    signal: SaveSignal,
    flush_lock: Mutex<()>,
    stats: Mutex<FlushStats>,
}

/// Copy a raw image into SQLite-owned memory and attach it as `main`.
pub fn load_image(bytes: &[u8]) -> Result<Connection> {
    if bytes.is_empty() {
        return Err(StoreError::InvalidFormat("database image is empty".into()));
    }
    let size: i32 = bytes
        .len()
        .try_into()
        .map_err(|_| StoreError::InvalidFormat("database image too large".into()))?;
    let mut conn = Connection::open_in_memory()?;
    // SQLite must own the buffer so it can grow and free it on close.
    let data = unsafe {
        let raw = rusqlite::ffi::sqlite3_malloc(size) as *mut u8;
        let ptr = NonNull::new(raw)
            .ok_or_else(|| StoreError::InvalidFormat("sqlite3_malloc returned null".into()))?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        OwnedData::from_raw_nonnull(ptr, bytes.len())
    };
    conn.deserialize(DatabaseName::Main, data, false)?;
    Ok(conn)
}

pub fn serialize_image(conn: &Connection) -> Result<Vec<u8>> {
    Ok(conn.serialize(DatabaseName::Main)?.to_vec())
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

fn file_digest(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut h = Sha256::new();
    h.update(std::fs::read(path)?);
    Ok(h.finalize().to_vec())
}

impl Database {
    /// Run the startup algorithm. Errors here are startup-fatal.
    pub fn open(
        paths: &DataPaths,
        options: EngineOptions,
        file: DatabaseFile,
        master: DataKey,
    ) -> Result<(Self, StartupReport)> {
        std::fs::create_dir_all(paths.root())?;

        if !options.file_encryption {
            tracing::warn!(path = %paths.plaintext().display(), "file encryption disabled; database stored in plaintext");
            let conn = Connection::open(paths.plaintext())?;
            configure(&conn)?;
            schema::apply_baseline(&conn)?;
            let report = StartupReport {
                source: LoadSource::PlaintextFile,
                fallback: None,
                quarantined: None,
                legacy: None,
                manual_intervention: false,
                residual_removed: false,
            };
            return Ok((Self::with_connection(conn, None), report));
        }

        let mut report = StartupReport {
            source: LoadSource::Fresh,
            fallback: None,
            quarantined: None,
            legacy: None,
            manual_intervention: false,
            residual_removed: false,
        };

        let migrator = LegacyMigrator::new(paths, &file, &master, options.hardware_binding);
        let status = migrator.check_status()?;
        match status.state {
            MigrationState::NeedsMigration => {
                tracing::info!(size = status.unencrypted_size, "legacy plaintext database found; migrating");
                report.legacy = Some(migrator.migrate()?);
            }
            MigrationState::Ambiguous => {
                tracing::error!(
                    plaintext = %paths.plaintext().display(),
                    encrypted = %paths.encrypted().display(),
                    "both plaintext and encrypted databases exist; manual intervention required"
                );
                report.manual_intervention = true;
            }
            MigrationState::FreshInstall | MigrationState::AlreadyMigrated => {}
        }

        let encrypted_path = paths.encrypted();
        let mut conn = None;
        if encrypted_path.exists() {
            match file.read(&encrypted_path, &master).and_then(|buf| load_image(&buf)) {
                Ok(c) => {
                    report.source = if report.legacy.is_some() {
                        LoadSource::Migrated
                    } else {
                        LoadSource::Encrypted
                    };
                    conn = Some(c);
                }
                Err(e) if e.is_unreadable_file() || matches!(e, StoreError::Sqlite(_)) => {
                    if options.required {
                        tracing::error!(error = %e, "encrypted database unusable and encryption is required");
                        return Err(e);
                    }
                    let quarantine = paths.unreadable(&artifact_timestamp());
                    std::fs::rename(&encrypted_path, &quarantine)?;
                    tracing::error!(
                        error = %e,
                        moved_to = %quarantine.display(),
                        "encrypted database unusable; starting with an empty database"
                    );
                    report.fallback = Some(e.to_string());
                    report.quarantined = Some(quarantine);
                }
                Err(e) => return Err(e),
            }
        }

        let conn = match conn {
            Some(c) => c,
            None => Connection::open_in_memory()?,
        };
        configure(&conn)?;
        schema::apply_baseline(&conn)?;

        // Migration renames the legacy file, so one only appears here when it was
        // written after classification, e.g. by a stale process still on the old path.
        if paths.plaintext().exists() && !report.manual_intervention {
            report.residual_removed = remove_residual_plaintext(paths, &RetryPolicy::default(), &ThreadSleeper)?;
        }

        let persistence = Persistence {
            file,
            path: encrypted_path,
            key: master,
            bind_hardware: options.hardware_binding,
        };
        tracing::info!(source = ?report.source, "database ready in memory");
        Ok((Self::with_connection(conn, Some(persistence)), report))
    }

    fn with_connection(conn: Connection, persistence: Option<Persistence>) -> Self {
        Self {
            conn: Mutex::new(conn),
            persistence,
            signal: SaveSignal::default(),
            flush_lock: Mutex::new(()),
            stats: Mutex::new(FlushStats::default()),
        }
    }

    /// An unpersisted in-memory database with the baseline schema.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        schema::apply_baseline(&conn)?;
        Ok(Self::with_connection(conn, None))
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_encrypted(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.path.as_path())
    }

    pub fn save_signal(&self) -> &SaveSignal {
        &self.signal
    }

    pub fn trigger_save(&self, reason: &str) {
        if self.persistence.is_some() {
            self.signal.request(reason);
        }
    }

    /// Read-only access; does not schedule a flush.
    pub fn read<T, E>(&self, f: impl FnOnce(&Connection) -> std::result::Result<T, E>) -> Result<T>
    where
        StoreError: From<E>,
    {
        Ok(f(&self.lock())?)
    }

    /// Write-class access; a successful call schedules a flush.
    pub fn write<T>(&self, reason: &str, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let out = {
            let mut conn = self.lock();
            f(&mut conn)?
        };
        self.trigger_save(reason);
        Ok(out)
    }

    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.write("execute", |conn| Ok(conn.execute(sql, params)?))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.write("execute_batch", |conn| Ok(conn.execute_batch(sql)?))
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize_image(&self.lock())
    }

    /// Serialize under the connection lock, then encrypt and write outside it.
    /// One flush at a time.
    pub fn flush(&self) -> Result<FlushOutcome> {
        let Some(p) = &self.persistence else {
            return Ok(FlushOutcome {
                bytes: 0,
                elapsed: Duration::ZERO,
            });
        };
        let _guard = self.flush_lock.lock().unwrap_or_else(|e| e.into_inner());
        let started = Instant::now();
        let result = self
            .serialize()
            .and_then(|image| p.file.write(&image, &p.path, &p.key, p.bind_hardware).map(|_| image.len()));

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(bytes) => {
                stats.flushes += 1;
                stats.last_flush_at = Some(Utc::now());
                stats.last_error = None;
                Ok(FlushOutcome {
                    bytes,
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => {
                stats.failures += 1;
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> FlushStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of user tables (catalog tables excluded).
    pub fn table_count(&self) -> Result<i64> {
        self.read(|c| {
            c.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |r| r.get(0),
            )
        })
    }
}

/// Delete the plaintext file left at the legacy path, but only when a backup or
/// migrated copy with identical content exists. Returns true when deleted.
fn remove_residual_plaintext(paths: &DataPaths, policy: &RetryPolicy, sleeper: &dyn Sleeper) -> Result<bool> {
    let plaintext = paths.plaintext();
    let digest = file_digest(&plaintext)?;
    let mut preserved = false;
    for prefix in [MIGRATED_PREFIX, BACKUP_PREFIX] {
        for candidate in paths.artifacts(prefix)? {
            if file_digest(&candidate).map(|d| d == digest).unwrap_or(false) {
                preserved = true;
                break;
            }
        }
        if preserved {
            break;
        }
    }
    if !preserved {
        tracing::warn!(path = %plaintext.display(), "residual plaintext database has no preserved copy; leaving it in place");
        return Ok(false);
    }
    remove_file_with_retry(&plaintext, policy, sleeper)?;
    tracing::info!(path = %plaintext.display(), "removed residual plaintext database");
    Ok(true)
}
