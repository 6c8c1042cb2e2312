//! Integration tests: bootstrap, reload, legacy migration, hardware binding,
//! per-user field encryption and background flushing.

use rusqlite::{params, Connection};
use sealdb::{
    config::{FlushConfig, StoreConfig},
    context::PersistenceContext,
    crypto::{
        fingerprint::HardwareFingerprint,
        secrets::{SecretKind, SecretPolicy, SecretStore},
        user::KeyVault,
        FieldCipher, Record,
    },
    storage::{schema::SSH_DATA, DatabaseFile, FlushScheduler, LoadSource, MigrationState},
    StoreError,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config(dir: &Path) -> StoreConfig {
    let mut c = StoreConfig::default();
    c.data_dir = dir.to_path_buf();
    c
}

fn open(config: StoreConfig, seed: char) -> sealdb::Result<PersistenceContext> {
    let secrets = SecretStore::new(HashMap::new(), config.env_file_path(), SecretPolicy::default());
    let fingerprint = HardwareFingerprint::with_probes(Some(seed.to_string().repeat(40)), Vec::new());
    PersistenceContext::bootstrap_with(config, secrets, fingerprint, KeyVault::new(1_000))
}

fn record(v: serde_json::Value) -> Record {
    v.as_object().unwrap().clone()
}

#[test]
fn fresh_install_persists_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(config(dir.path()), 'a').unwrap();
    assert_eq!(ctx.startup_report().source, LoadSource::Fresh);
    let status = ctx.status();
    assert!(status.initialized && status.configuration_valid && status.encryption_enabled);
    assert!(DatabaseFile::is_encrypted_database_file(&ctx.paths().encrypted()));

    ctx.database()
        .execute("INSERT INTO settings (key, value) VALUES ('motd', 'hello')", [])
        .unwrap();
    ctx.shutdown().unwrap();
    let master = ctx.secrets().get(SecretKind::MasterKey).unwrap().value().to_string();
    drop(ctx);

    let ctx = open(config(dir.path()), 'a').unwrap();
    assert_eq!(ctx.startup_report().source, LoadSource::Encrypted);
    assert_eq!(ctx.secrets().get(SecretKind::MasterKey).unwrap().value(), master);
    let motd: String = ctx
        .database()
        .read(|c| c.query_row("SELECT value FROM settings WHERE key = 'motd'", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(motd, "hello");
    let applied: i64 = ctx
        .database()
        .read(|c| c.query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(applied, 3);
}

fn write_legacy_database(path: &Path, hosts: i64) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE users (
            id TEXT PRIMARY KEY, username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL, totp_secret TEXT
         );
         CREATE TABLE ssh_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL REFERENCES users(id),
            ip TEXT NOT NULL, username TEXT NOT NULL,
            auth_type TEXT NOT NULL DEFAULT 'password',
            password TEXT, key TEXT, key_password TEXT
         );
         CREATE TABLE notes (id INTEGER PRIMARY KEY, user_id TEXT REFERENCES users(id), body TEXT);
         INSERT INTO users VALUES ('u1', 'alice', 'h1', NULL), ('u2', 'bob', 'h2', 'TOTP'), ('u3', 'carol', 'h3', NULL);",
    )
    .unwrap();
    for i in 0..hosts {
        let owner = ["u1", "u2", "u3"][(i % 3) as usize];
        conn.execute(
            "INSERT INTO ssh_data (user_id, ip, username, password, key) VALUES (?1, ?2, 'root', ?3, ?4)",
            params![owner, format!("10.0.0.{i}"), (i % 2 == 0).then(|| "pw"), (i % 2 == 1).then(|| "KEY")],
        )
        .unwrap();
    }
    for i in 0..10 {
        conn.execute("INSERT INTO notes VALUES (?1, 'u1', ?2)", params![i, format!("note {i}")])
            .unwrap();
    }
}

#[test]
fn legacy_database_is_migrated_once_with_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    std::fs::create_dir_all(&cfg.data_dir).unwrap();
    write_legacy_database(&dir.path().join("db.sqlite"), 50);

    let ctx = open(cfg.clone(), 'a').unwrap();
    let report = ctx.startup_report();
    assert_eq!(report.source, LoadSource::Migrated);
    let legacy = report.legacy.as_ref().unwrap();
    assert_eq!(legacy.tables, 3);
    assert_eq!(legacy.rows, 63);
    assert!(legacy.backup_path.exists());
    assert!(legacy.migrated_path.exists());
    assert!(!ctx.paths().plaintext().exists());
    assert_eq!(ctx.migration_status().unwrap().state, MigrationState::AlreadyMigrated);

    let (hosts, keyed): (i64, i64) = ctx
        .database()
        .read(|c| {
            c.query_row(
                "SELECT COUNT(*), SUM(auth_type = 'key') FROM ssh_data",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
        })
        .unwrap();
    assert_eq!(hosts, 50);
    assert_eq!(keyed, 25);
    drop(ctx);

    // second boot loads the encrypted file; nothing is migrated again
    let ctx = open(cfg, 'a').unwrap();
    assert_eq!(ctx.startup_report().source, LoadSource::Encrypted);
    assert!(ctx.startup_report().legacy.is_none());
}

#[test]
fn both_databases_present_needs_manual_intervention() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(config(dir.path()), 'a').unwrap();
    ctx.shutdown().unwrap();
    drop(ctx);

    write_legacy_database(&dir.path().join("db.sqlite"), 3);
    let before = std::fs::read(dir.path().join("db.sqlite")).unwrap();

    let ctx = open(config(dir.path()), 'a').unwrap();
    assert!(ctx.startup_report().manual_intervention);
    assert_eq!(ctx.startup_report().source, LoadSource::Encrypted);
    assert!(ctx.status().manual_intervention);
    assert_eq!(ctx.migration_status().unwrap().state, MigrationState::Ambiguous);
    assert_eq!(std::fs::read(dir.path().join("db.sqlite")).unwrap(), before);
}

#[test]
fn foreign_host_is_rejected_or_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(config(dir.path()), 'a').unwrap();
    ctx.database()
        .execute("INSERT INTO settings (key, value) VALUES ('k', 'v')", [])
        .unwrap();
    ctx.shutdown().unwrap();
    drop(ctx);

    let mut required = config(dir.path());
    required.encryption.required = true;
    assert!(matches!(open(required, 'b'), Err(StoreError::HardwareMismatch)));
    assert!(dir.path().join("db.sqlite.encrypted").exists());

    let ctx = open(config(dir.path()), 'b').unwrap();
    let status = ctx.status();
    assert!(status.startup_fallback.is_some());
    let quarantined = ctx.startup_report().quarantined.clone().unwrap();
    assert!(quarantined.exists());
    let rows: i64 = ctx
        .database()
        .read(|c| c.query_row("SELECT COUNT(*) FROM settings", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(rows, 0);
}

#[test]
fn user_fields_are_encrypted_at_rest_and_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(config(dir.path()), 'a').unwrap();
    ctx.database()
        .execute(
            "INSERT INTO users (id, username, password_hash) VALUES ('u1', 'alice', 'hash')",
            [],
        )
        .unwrap();
    ctx.setup_user_key("u1", "correct horse").unwrap();
    assert!(ctx.can_user_access_data("u1"));

    let host = record(json!({
        "id": 1, "user_id": "u1", "ip": "10.1.1.1", "username": "root",
        "password": "s3cret-password", "key": null, "key_password": null
    }));
    let sealed = ctx.encrypt_record_for_user("u1", &SSH_DATA, &host).unwrap();
    let stored_pw = sealed["password"].as_str().unwrap().to_string();
    assert!(FieldCipher::is_encrypted(&stored_pw));
    ctx.database()
        .execute(
            "INSERT INTO ssh_data (id, user_id, ip, username, password) VALUES (1, 'u1', '10.1.1.1', 'root', ?1)",
            params![stored_pw],
        )
        .unwrap();
    ctx.shutdown().unwrap();

    let raw = std::fs::read(ctx.paths().encrypted()).unwrap();
    assert!(!raw.windows(b"s3cret-password".len()).any(|w| w == b"s3cret-password"));
    assert!(!raw.windows(b"alice".len()).any(|w| w == b"alice"));
    drop(ctx);

    let ctx = open(config(dir.path()), 'a').unwrap();
    assert!(!ctx.can_user_access_data("u1"));
    assert!(matches!(
        ctx.unlock_user("u1", "wrong"),
        Err(StoreError::AuthenticationFailure)
    ));
    ctx.unlock_user("u1", "correct horse").unwrap();

    let password: String = ctx
        .database()
        .read(|c| c.query_row("SELECT password FROM ssh_data WHERE id = 1", [], |r| r.get(0)))
        .unwrap();
    let row = record(json!({"id": 1, "password": password}));
    let plain = ctx.decrypt_record_for_user("u1", &SSH_DATA, &row).unwrap();
    assert_eq!(plain["password"], "s3cret-password");

    // a row-swapped ciphertext is skipped, a legacy plaintext row passes through
    let mut swapped = row.clone();
    swapped.insert("id".into(), json!(2));
    let legacy = record(json!({"id": 3, "password": "old-plain"}));
    let out = ctx
        .decrypt_records_for_user("u1", &SSH_DATA, &[row, swapped, legacy])
        .unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[1]["password"], "old-plain");

    ctx.change_user_password("u1", "correct horse", "battery staple").unwrap();
    assert!(ctx.lock_user("u1"));
    assert!(ctx.unlock_user("u1", "correct horse").is_err());
    ctx.unlock_user("u1", "battery staple").unwrap();
    assert!(ctx.get_user_data_key("u1").is_some());
}

#[tokio::test]
async fn scheduler_coalesces_a_burst_into_one_flush() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(config(dir.path()), 'a').unwrap();
    let db = Arc::clone(ctx.database());
    let after_bootstrap = db.stats().flushes;

    let scheduler = FlushScheduler::spawn(
        Arc::clone(&db),
        &FlushConfig {
            interval_secs: 3600,
            debounce_ms: 20,
        },
    );
    for i in 0..5 {
        db.execute(
            "INSERT INTO settings (key, value) VALUES (?1, 'x')",
            params![format!("k{i}")],
        )
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.stop().await;

    let stats = db.stats();
    assert_eq!(stats.flushes, after_bootstrap + 1);
    assert_eq!(stats.failures, 0);
    assert!(!db.save_signal().is_pending());
}

fn settings_rows(db: &sealdb::storage::Database) -> i64 {
    db.read(|c| c.query_row("SELECT COUNT(*) FROM settings", [], |r| r.get(0)))
        .unwrap()
}

#[tokio::test]
async fn failed_flush_keeps_memory_and_recovers_on_the_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let aside = dir.path().join("data.aside");
    let ctx = open(config(&data), 'a').unwrap();
    let db = Arc::clone(ctx.database());
    let flushed = db.stats().flushes;

    let scheduler = FlushScheduler::spawn(
        Arc::clone(&db),
        &FlushConfig {
            interval_secs: 1,
            debounce_ms: 20,
        },
    );

    // a regular file where the data directory was makes every write fail
    std::fs::rename(&data, &aside).unwrap();
    std::fs::write(&data, b"not a directory").unwrap();
    db.execute("INSERT INTO settings (key, value) VALUES ('kept', 'yes')", [])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = db.stats();
    assert!(stats.failures > 0);
    assert!(stats.last_error.is_some());
    assert_eq!(stats.flushes, flushed);
    assert_eq!(settings_rows(&db), 1);

    std::fs::remove_file(&data).unwrap();
    std::fs::rename(&aside, &data).unwrap();
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    scheduler.stop().await;

    let stats = db.stats();
    assert!(stats.flushes > flushed);
    assert!(stats.last_error.is_none());
    drop(ctx);

    let ctx = open(config(&data), 'a').unwrap();
    assert_eq!(settings_rows(ctx.database()), 1);
}

#[tokio::test]
async fn interval_flushes_without_writes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(config(dir.path()), 'a').unwrap();
    let db = Arc::clone(ctx.database());
    let flushed = db.stats().flushes;

    let scheduler = FlushScheduler::spawn(
        Arc::clone(&db),
        &FlushConfig {
            interval_secs: 1,
            debounce_ms: 20,
        },
    );
    tokio::time::sleep(Duration::from_millis(2_300)).await;
    scheduler.stop().await;

    let stats = db.stats();
    assert!(stats.flushes > flushed);
    assert_eq!(stats.failures, 0);
    assert!(!db.save_signal().is_pending());
}
