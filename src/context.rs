//! The persistence context: one explicitly constructed object owning the secret
//! store, the host fingerprint, the live database and the unlocked user keys.
//! Build it once at startup with [`PersistenceContext::bootstrap`] and share it
//! behind an `Arc`; tests build a fresh one per case.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::crypto::field::{DataKey, FieldCipher};
use crate::crypto::fingerprint::{FingerprintSource, HardwareFingerprint};
use crate::crypto::secrets::{SecretKind, SecretOrigin, SecretPolicy, SecretStore};
use crate::crypto::user::{FieldPolicy, KeyVault, Record, UserDataCrypto, UserKeyRing};
use crate::error::{Result, StoreError};
use crate::logging::StoreEvent;
use crate::storage::encrypted::DatabaseFile;
use crate::storage::engine::{Database, EngineOptions, FlushOutcome, StartupReport};
use crate::storage::legacy::{self, MigrationStatus, RETAINED_ARTIFACTS};
use crate::storage::migrator::SchemaMigrator;
use crate::storage::paths::DataPaths;
use crate::storage::schema::{self, TableSchema};

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub encryption_enabled: bool,
    pub encryption_required: bool,
    /// In-memory round trip of the file format and the field cipher
    pub configuration_valid: bool,
    pub initialized: bool,
    pub hardware_bound: bool,
    pub fingerprint_source: FingerprintSource,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub flush_failures: u64,
    pub startup_fallback: Option<String>,
    pub manual_intervention: bool,
    pub unlocked_users: usize,
}

/// Seal and open a small buffer and a single field, entirely in memory.
fn encryption_self_test(file: &DatabaseFile, master: &DataKey, bind_hardware: bool) -> bool {
    let sample = b"sealdb self-test";
    let file_ok = file
        .seal(sample, master, bind_hardware)
        .and_then(|sealed| file.open(&sealed, master));
    let key = DataKey::generate();
    let field_ok = FieldCipher::encrypt("self-test", &key, "0", "health")
        .and_then(|f| FieldCipher::decrypt(&f, &key, "0", "health"));
    match (file_ok, field_ok) {
        (Ok(image), Ok(text)) => image == sample && text == "self-test",
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "encryption self-test failed");
            false
        }
    }
}

/// What a separate process can tell about a data directory without opening
/// the database. Produced by [`inspect_disk`].
#[derive(Debug, Clone, Serialize)]
pub struct DiskStatus {
    pub encryption_enabled: bool,
    pub encryption_required: bool,
    pub configuration_valid: bool,
    pub master_key_available: bool,
    pub fingerprint_source: FingerprintSource,
    pub migration: MigrationStatus,
    pub manual_intervention: bool,
    /// Header flag of the encrypted file, when one exists
    pub hardware_bound: Option<bool>,
    /// Whether this host and key can decrypt the encrypted file
    pub encrypted_file_readable: Option<bool>,
    pub encrypted_file_error: Option<String>,
    pub last_flush_at: Option<DateTime<Utc>>,
}

/// Read-only health check of a data directory. Never generates secrets,
/// migrates, quarantines or writes the encrypted file, so it is safe beside a
/// running store.
pub fn inspect_disk(
    config: &StoreConfig,
    secrets: &SecretStore,
    fingerprint: Arc<HardwareFingerprint>,
) -> Result<DiskStatus> {
    let paths = DataPaths::new(&config.data_dir);
    let migration = legacy::classify(&paths)?;
    let fingerprint_source = fingerprint.generate().source;
    let file = DatabaseFile::new(fingerprint);

    let master = match secrets.lookup(SecretKind::MasterKey)? {
        Some(secret) => Some(DataKey::from_hex(secret.value())?),
        None => None,
    };
    let configuration_valid = encryption_self_test(
        &file,
        &master.clone().unwrap_or_else(DataKey::generate),
        config.encryption.hardware_binding,
    );

    let encrypted = paths.encrypted();
    let mut status = DiskStatus {
        encryption_enabled: config.encryption.file_encryption,
        encryption_required: config.encryption.required,
        configuration_valid,
        master_key_available: master.is_some(),
        fingerprint_source,
        manual_intervention: migration.state == legacy::MigrationState::Ambiguous,
        migration,
        hardware_bound: None,
        encrypted_file_readable: None,
        encrypted_file_error: None,
        last_flush_at: None,
    };
    if !status.migration.has_encrypted_db {
        return Ok(status);
    }

    status.last_flush_at = std::fs::metadata(&encrypted)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    match DatabaseFile::inspect(&encrypted) {
        Ok(header) => status.hardware_bound = Some(header.hardware_bound),
        Err(e) => {
            status.encrypted_file_readable = Some(false);
            status.encrypted_file_error = Some(e.to_string());
            return Ok(status);
        }
    }
    if let Some(master) = &master {
        match file.read(&encrypted, master) {
            Ok(_) => status.encrypted_file_readable = Some(true),
            Err(e) => {
                status.encrypted_file_readable = Some(false);
                status.encrypted_file_error = Some(e.to_string());
            }
        }
    }
    Ok(status)
}

pub struct PersistenceContext {
    config: StoreConfig,
    paths: DataPaths,
    secrets: SecretStore,
    fingerprint: Arc<HardwareFingerprint>,
    file: DatabaseFile,
    db: Arc<Database>,
    startup: StartupReport,
    crypto: UserDataCrypto,
    vault: KeyVault,
    keys: UserKeyRing,
    initialized: AtomicBool,
}

impl PersistenceContext {
    /// Secrets from the process environment and env file, fingerprint from
    /// this host (or the configured seed).
    pub fn bootstrap(config: StoreConfig) -> Result<Self> {
        let policy = SecretPolicy {
            persistence_required: config.secrets.persistence_required,
            reject_weak_env: config.encryption.required,
            export_to_process: true,
        };
        let secrets = SecretStore::from_process_env(config.env_file_path(), policy);
        let fingerprint = HardwareFingerprint::new(config.encryption.fingerprint_seed.clone());
        Self::bootstrap_with(config, secrets, fingerprint, KeyVault::default())
    }

    /// Startup sequence with explicit collaborators. Every error is fatal.
    pub fn bootstrap_with(
        config: StoreConfig,
        secrets: SecretStore,
        fingerprint: HardwareFingerprint,
        vault: KeyVault,
    ) -> Result<Self> {
        let paths = DataPaths::new(&config.data_dir);

        secrets.initialize_all()?;
        for kind in SecretKind::ALL {
            let secret = secrets.get(kind)?;
            if secret.origin == SecretOrigin::Generated {
                let mut ev = StoreEvent::new("warn", "secret_generated")
                    .reason(kind.env_name())
                    .path(secrets.env_file());
                if !secret.persisted {
                    ev = ev.error("not persisted; valid for this process only");
                }
                ev.emit();
            }
        }

        let fingerprint = Arc::new(fingerprint);
        let fp = fingerprint.generate();
        if fp.is_fallback() && config.encryption.hardware_binding {
            tracing::warn!("encrypted file will be bound to a low-entropy fallback fingerprint");
        }
        tracing::info!(source = ?fp.source, identifiers = fp.identifiers, "hardware fingerprint ready");

        let file = DatabaseFile::new(Arc::clone(&fingerprint));
        let options = EngineOptions {
            file_encryption: config.encryption.file_encryption,
            required: config.encryption.required,
            hardware_binding: config.encryption.hardware_binding,
        };
        let (db, startup) = Database::open(&paths, options, file.clone(), secrets.master_key()?)?;
        Self::audit_startup(&paths, &startup);

        let migrator = SchemaMigrator::builtin()?;
        let applied = db.write("schema_migration", |conn| {
            let applied = migrator.run_migrations(conn)?;
            schema::verify_descriptors(conn)?;
            Ok(applied)
        })?;
        if !applied.is_empty() {
            tracing::info!(applied = ?applied, "schema brought up to date");
        }

        if db.is_encrypted() {
            match db.flush() {
                Ok(out) => tracing::info!(bytes = out.bytes, "initial flush written"),
                Err(e) => tracing::warn!(error = %e, "initial flush failed; will retry on next cycle"),
            }
        }

        let policy = if config.encryption.strict_fields {
            FieldPolicy::Strict
        } else {
            FieldPolicy::Optional
        };
        let ctx = Self {
            keys: UserKeyRing::new(Duration::from_secs(config.session_idle_secs)),
            crypto: UserDataCrypto::new(policy),
            vault,
            config,
            paths,
            secrets,
            fingerprint,
            file,
            db: Arc::new(db),
            startup,
            initialized: AtomicBool::new(false),
        };
        ctx.initialized.store(true, Ordering::Release);
        tracing::info!(encrypted = ctx.db.is_encrypted(), "persistence initialized");
        Ok(ctx)
    }

    fn audit_startup(paths: &DataPaths, report: &StartupReport) {
        if let Some(reason) = &report.fallback {
            let mut ev = StoreEvent::new("error", "encrypted_file_unusable")
                .reason("started with an empty database")
                .error(reason);
            if let Some(q) = &report.quarantined {
                ev = ev.path(q);
            }
            ev.emit();
        }
        if let Some(m) = &report.legacy {
            StoreEvent::new("info", "legacy_migration")
                .reason(format!("{} tables, {} rows", m.tables, m.rows))
                .path(&m.backup_path)
                .emit();
        }
        if report.manual_intervention {
            StoreEvent::new("error", "manual_intervention_required")
                .reason("plaintext and encrypted databases both present")
                .path(&paths.plaintext())
                .emit();
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create the user's data key, wrapped under `password`, and unlock it.
    pub fn setup_user_key(&self, user_id: &str, password: &str) -> Result<()> {
        self.ensure_initialized()?;
        let dek = self
            .db
            .write("user_key_setup", |conn| self.vault.setup_user(conn, user_id, password))?;
        self.keys.insert(user_id, dek);
        Ok(())
    }

    /// Login hook: unwrap the stored key into the key ring.
    pub fn unlock_user(&self, user_id: &str, password: &str) -> Result<()> {
        self.ensure_initialized()?;
        let dek = self.db.read(|conn| self.vault.unlock(conn, user_id, password))?;
        self.keys.insert(user_id, dek);
        tracing::debug!(user_id, "user data key unlocked");
        Ok(())
    }

    /// Logout hook. Returns false when no key was held.
    pub fn lock_user(&self, user_id: &str) -> bool {
        self.keys.remove(user_id)
    }

    pub fn change_user_password(&self, user_id: &str, old: &str, new: &str) -> Result<()> {
        self.ensure_initialized()?;
        let dek = self.db.write("user_key_rewrap", |conn| {
            self.vault.change_password(conn, user_id, old, new)
        })?;
        self.keys.insert(user_id, dek);
        Ok(())
    }

    pub fn get_user_data_key(&self, user_id: &str) -> Option<DataKey> {
        self.keys.get(user_id)
    }

    pub fn can_user_access_data(&self, user_id: &str) -> bool {
        self.keys.is_unlocked(user_id)
    }

    pub fn purge_expired_keys(&self) -> usize {
        self.keys.purge_expired()
    }

    fn user_key(&self, user_id: &str) -> Result<DataKey> {
        self.get_user_data_key(user_id)
            .ok_or_else(|| StoreError::UserLocked(user_id.to_string()))
    }

    pub fn encrypt_record_for_user(&self, user_id: &str, table: &TableSchema, record: &Record) -> Result<Record> {
        self.crypto.encrypt_record(table, record, &self.user_key(user_id)?)
    }

    pub fn decrypt_record_for_user(&self, user_id: &str, table: &TableSchema, record: &Record) -> Result<Record> {
        self.crypto.decrypt_record(table, record, &self.user_key(user_id)?)
    }

    /// Decrypt many records; a record that fails is logged and left out.
    pub fn decrypt_records_for_user(&self, user_id: &str, table: &TableSchema, records: &[Record]) -> Result<Vec<Record>> {
        let key = self.user_key(user_id)?;
        let mut out = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            match self.crypto.decrypt_record(table, record, &key) {
                Ok(r) => out.push(r),
                Err(e) => tracing::warn!(
                    user_id,
                    table = table.name,
                    idx,
                    record_id = ?record.get(table.id_column),
                    error = %e,
                    "skipping record that failed to decrypt"
                ),
            }
        }
        Ok(out)
    }

    pub fn trigger_save(&self, reason: &str) {
        self.db.trigger_save(reason);
    }

    pub fn status(&self) -> HealthStatus {
        let stats = self.db.stats();
        let encryption_enabled = self.db.is_encrypted();
        HealthStatus {
            encryption_enabled,
            encryption_required: self.config.encryption.required,
            configuration_valid: self
                .secrets
                .master_key()
                .map(|master| encryption_self_test(&self.file, &master, self.config.encryption.hardware_binding))
                .unwrap_or(false),
            initialized: self.is_initialized(),
            hardware_bound: encryption_enabled && self.config.encryption.hardware_binding,
            fingerprint_source: self.fingerprint.generate().source,
            last_flush_at: stats.last_flush_at,
            flush_failures: stats.failures,
            startup_fallback: self.startup.fallback.clone(),
            manual_intervention: self.startup.manual_intervention,
            unlocked_users: self.keys.len(),
        }
    }

    pub fn migration_status(&self) -> Result<MigrationStatus> {
        legacy::classify(&self.paths)
    }

    pub fn cleanup(&self) -> Result<usize> {
        legacy::cleanup_artifacts(&self.paths, RETAINED_ARTIFACTS)
    }

    /// Final synchronous flush. The context stays usable but reports itself
    /// uninitialized afterwards.
    pub fn shutdown(&self) -> Result<FlushOutcome> {
        self.initialized.store(false, Ordering::Release);
        let outcome = self.db.flush();
        match &outcome {
            Ok(out) => tracing::info!(bytes = out.bytes, "final flush written"),
            Err(e) => tracing::error!(error = %e, "final flush failed"),
        }
        outcome
    }
}
