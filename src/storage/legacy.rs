//! One-time conversion of a pre-encryption plaintext database into the
//! encrypted in-memory format.
//!
//! The original file is only ever copied (backup) and renamed (migrated), never
//! deleted, so every failure leaves a manually recoverable state.

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::crypto::field::DataKey;
use crate::error::{Result, StoreError};
use crate::storage::encrypted::DatabaseFile;
use crate::storage::engine::{load_image, serialize_image};
use crate::storage::migrator::quote_ident;
use crate::storage::paths::{artifact_timestamp, DataPaths, BACKUP_PREFIX, MIGRATED_PREFIX};

/// How many backup and migrated artifacts `cleanup_old_files` keeps of each.
pub const RETAINED_ARTIFACTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    FreshInstall,
    AlreadyMigrated,
    NeedsMigration,
    /// Both files present; migration refused
    Ambiguous,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationStatus {
    pub state: MigrationState,
    pub needs_migration: bool,
    pub has_unencrypted_db: bool,
    pub has_encrypted_db: bool,
    pub unencrypted_size: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStep {
    Status,
    Backup,
    OpenSource,
    CopySchema,
    CopyRows,
    ForeignKeyCheck,
    Verify,
    Encrypt,
    Validate,
    Rename,
}

impl MigrationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStep::Status => "status",
            MigrationStep::Backup => "backup",
            MigrationStep::OpenSource => "open_source",
            MigrationStep::CopySchema => "copy_schema",
            MigrationStep::CopyRows => "copy_rows",
            MigrationStep::ForeignKeyCheck => "foreign_key_check",
            MigrationStep::Verify => "verify",
            MigrationStep::Encrypt => "encrypt",
            MigrationStep::Validate => "validate",
            MigrationStep::Rename => "rename",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationReport {
    pub tables: usize,
    pub rows: u64,
    pub backup_path: PathBuf,
    pub migrated_path: PathBuf,
    pub duration: Duration,
}

struct TableDef {
    name: String,
    sql: String,
}

/// Classify the data directory without touching anything.
pub fn classify(paths: &DataPaths) -> Result<MigrationStatus> {
    let plaintext = paths.plaintext();
    let encrypted = paths.encrypted();
    let has_unencrypted_db = plaintext.is_file();
    let has_encrypted_db = encrypted.is_file() && DatabaseFile::is_encrypted_database_file(&encrypted);
    let unencrypted_size = if has_unencrypted_db {
        std::fs::metadata(&plaintext)?.len()
    } else {
        0
    };

    let (state, reason) = match (has_unencrypted_db, has_encrypted_db) {
        (false, false) => (MigrationState::FreshInstall, "fresh installation"),
        (false, true) => (MigrationState::AlreadyMigrated, "already migrated"),
        (true, false) => (MigrationState::NeedsMigration, "plaintext database needs migration"),
        (true, true) => (
            MigrationState::Ambiguous,
            "both plaintext and encrypted databases exist; manual intervention required",
        ),
    };
    Ok(MigrationStatus {
        state,
        needs_migration: state == MigrationState::NeedsMigration,
        has_unencrypted_db,
        has_encrypted_db,
        unencrypted_size,
        reason: reason.to_string(),
    })
}

pub struct LegacyMigrator<'a> {
    paths: &'a DataPaths,
    file: &'a DatabaseFile,
    key: &'a DataKey,
    bind_hardware: bool,
}

impl<'a> LegacyMigrator<'a> {
    pub fn new(paths: &'a DataPaths, file: &'a DatabaseFile, key: &'a DataKey, bind_hardware: bool) -> Self {
        Self {
            paths,
            file,
            key,
            bind_hardware,
        }
    }

    pub fn check_status(&self) -> Result<MigrationStatus> {
        classify(self.paths)
    }

    pub fn migrate(&self) -> Result<MigrationReport> {
        let started = Instant::now();
        let result = self.run(started);
        match &result {
            Ok(report) => tracing::info!(
                tables = report.tables,
                rows = report.rows,
                backup = %report.backup_path.display(),
                migrated = %report.migrated_path.display(),
                ms = report.duration.as_millis() as u64,
                "legacy database migrated"
            ),
            Err(e) => tracing::error!(error = %e, "legacy database migration failed; original data untouched"),
        }
        result
    }

    fn run(&self, started: Instant) -> Result<MigrationReport> {
        let mut saved: Option<PathBuf> = None;
        let fail = |step: MigrationStep, backup: &Option<PathBuf>| {
            let backup = backup.clone();
            move |e: StoreError| StoreError::LegacyMigration {
                step: step.as_str(),
                message: e.to_string(),
                backup_path: backup,
                elapsed: started.elapsed(),
            }
        };

        let status = self.check_status()?;
        if !status.needs_migration {
            return Err(fail(MigrationStep::Status, &saved)(StoreError::Migration(status.reason)));
        }
        let source = self.paths.plaintext();
        let ts = artifact_timestamp();

        // 1. backup, byte size verified
        let backup = self.paths.backup(&ts);
        self.backup(&source, &backup, status.unencrypted_size)
            .map_err(fail(MigrationStep::Backup, &saved))?;
        saved = Some(backup.clone());

        // 2. open source read-only and a fresh in-memory target
        let (src, mut mem) = (|| -> Result<(Connection, Connection)> {
            let src = Connection::open_with_flags(&source, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            Ok((src, Connection::open_in_memory()?))
        })()
        .map_err(fail(MigrationStep::OpenSource, &saved))?;

        // 3. schema
        let tables = user_tables(&src).map_err(fail(MigrationStep::CopySchema, &saved))?;
        for t in &tables {
            mem.execute_batch(&t.sql)
                .map_err(|e| fail(MigrationStep::CopySchema, &saved)(e.into()))?;
        }

        // 4. rows, with foreign keys off during the copy
        let rows = copy_rows(&src, &mut mem, &tables).map_err(fail(MigrationStep::CopyRows, &saved))?;
        secondary_objects(&src)
            .and_then(|sqls| {
                sqls.iter()
                    .try_for_each(|sql| mem.execute_batch(sql).map_err(StoreError::from))
            })
            .map_err(fail(MigrationStep::CopySchema, &saved))?;
        foreign_key_check(&mem).map_err(fail(MigrationStep::ForeignKeyCheck, &saved))?;

        // 5. counts must match exactly
        verify_counts(&src, &mem, &tables).map_err(fail(MigrationStep::Verify, &saved))?;
        drop(src);

        // 6. encrypt
        let encrypted = self.paths.encrypted();
        serialize_image(&mem)
            .and_then(|image| self.file.write(&image, &encrypted, self.key, self.bind_hardware))
            .map_err(fail(MigrationStep::Encrypt, &saved))?;

        // 7. reopen what was written
        self.validate_written(tables.len())
            .map_err(fail(MigrationStep::Validate, &saved))?;

        // 8. rename, never delete
        let migrated = self.paths.migrated(&ts);
        std::fs::rename(&source, &migrated)
            .map_err(|e| fail(MigrationStep::Rename, &saved)(e.into()))?;

        Ok(MigrationReport {
            tables: tables.len(),
            rows,
            backup_path: backup,
            migrated_path: migrated,
            duration: started.elapsed(),
        })
    }

    fn backup(&self, source: &std::path::Path, backup: &std::path::Path, expected: u64) -> Result<()> {
        std::fs::copy(source, backup)?;
        let copied = std::fs::metadata(backup)?.len();
        if copied != expected {
            return Err(StoreError::MigrationVerification(format!(
                "backup size {copied} does not match source size {expected}"
            )));
        }
        tracing::info!(path = %backup.display(), bytes = copied, "legacy database backed up");
        Ok(())
    }

    fn validate_written(&self, expected_tables: usize) -> Result<()> {
        let encrypted = self.paths.encrypted();
        if !DatabaseFile::is_encrypted_database_file(&encrypted) {
            return Err(StoreError::InvalidFormat("written file lacks the format marker".into()));
        }
        let conn = load_image(&self.file.read(&encrypted, self.key)?)?;
        let check: String = conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
        if check != "ok" {
            return Err(StoreError::MigrationVerification(format!("quick_check: {check}")));
        }
        let found = user_tables(&conn)?.len();
        if found != expected_tables {
            return Err(StoreError::MigrationVerification(format!(
                "encrypted file has {found} tables, expected {expected_tables}"
            )));
        }
        Ok(())
    }

    pub fn cleanup_old_files(&self) -> Result<usize> {
        cleanup_artifacts(self.paths, RETAINED_ARTIFACTS)
    }
}

/// Keep the `keep` newest backups and migrated files; returns how many were deleted.
pub fn cleanup_artifacts(paths: &DataPaths, keep: usize) -> Result<usize> {
    let mut removed = 0;
    for prefix in [BACKUP_PREFIX, MIGRATED_PREFIX] {
        for old in paths.artifacts(prefix)?.into_iter().skip(keep) {
            match std::fs::remove_file(&old) {
                Ok(()) => {
                    tracing::info!(path = %old.display(), "removed old migration artifact");
                    removed += 1;
                }
                Err(e) => tracing::warn!(path = %old.display(), error = %e, "could not remove old migration artifact"),
            }
        }
    }
    Ok(removed)
}

fn user_tables(conn: &Connection) -> Result<Vec<TableDef>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
         ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(TableDef {
            name: r.get(0)?,
            sql: r.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Indexes, views and triggers, created after the data is in place.
fn secondary_objects(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master
         WHERE type IN ('index', 'view', 'trigger') AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
         ORDER BY CASE type WHEN 'index' THEN 0 WHEN 'view' THEN 1 ELSE 2 END, rowid",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn copy_rows(src: &Connection, mem: &mut Connection, tables: &[TableDef]) -> Result<u64> {
    mem.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let tx = mem.transaction()?;
    let mut total = 0u64;
    for t in tables {
        let mut select = src.prepare(&format!("SELECT * FROM {}", quote_ident(&t.name)))?;
        let cols = select.column_count();
        let placeholders = vec!["?"; cols].join(", ");
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {} VALUES ({placeholders})",
            quote_ident(&t.name)
        ))?;
        let mut rows = select.query([])?;
        let mut copied = 0u64;
        while let Some(row) = rows.next()? {
            let values = (0..cols)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            insert.execute(rusqlite::params_from_iter(values.iter()))?;
            copied += 1;
        }
        tracing::debug!(table = %t.name, rows = copied, "table copied");
        total += copied;
    }
    tx.commit()?;
    mem.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(total)
}

fn foreign_key_check(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let violations = stmt
        .query_map([], |r| {
            let table: String = r.get(0)?;
            let rowid: Option<i64> = r.get(1)?;
            let parent: String = r.get(2)?;
            Ok(format!("{table} rowid {} -> {parent}", rowid.map_or("?".into(), |v| v.to_string())))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if violations.is_empty() {
        return Ok(());
    }
    Err(StoreError::MigrationVerification(format!(
        "{} foreign key violation(s): {}",
        violations.len(),
        violations.join("; ")
    )))
}

fn verify_counts(src: &Connection, mem: &Connection, tables: &[TableDef]) -> Result<()> {
    let copied = user_tables(mem)?;
    if copied.len() != tables.len() {
        return Err(StoreError::MigrationVerification(format!(
            "table count {} does not match source {}",
            copied.len(),
            tables.len()
        )));
    }
    for t in tables {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&t.name));
        let expected: i64 = src.query_row(&sql, [], |r| r.get(0))?;
        let actual: i64 = mem.query_row(&sql, [], |r| r.get(0))?;
        if expected != actual {
            return Err(StoreError::MigrationVerification(format!(
                "table {} has {actual} rows, source has {expected}",
                t.name
            )));
        }
    }
    Ok(())
}
