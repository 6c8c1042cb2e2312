//! Baseline schema, additive columns, ordered migrations and the per-table
//! descriptors that say which columns hold sensitive values.

use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::storage::migrator::{Migration, Step};

/// Which columns of a table are envelope-encrypted with the owner's data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub id_column: &'static str,
    pub sensitive: &'static [&'static str],
}

impl TableSchema {
    pub const fn new(name: &'static str, sensitive: &'static [&'static str]) -> Self {
        Self {
            name,
            id_column: "id",
            sensitive,
        }
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive.contains(&field)
    }

    /// Fail if a sensitive column is missing from the live table.
    pub fn verify(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", self.name))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<_>>()?;
        if columns.is_empty() {
            return Err(StoreError::Config(format!("table {} does not exist", self.name)));
        }
        for field in self.sensitive.iter().chain(std::iter::once(&self.id_column)) {
            if !columns.iter().any(|c| c == field) {
                return Err(StoreError::Config(format!(
                    "table {} has no column {field}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

pub const USERS: TableSchema = TableSchema::new("users", &["totp_secret"]);
pub const SSH_DATA: TableSchema = TableSchema::new("ssh_data", &["password", "key", "key_password"]);
pub const SSH_CREDENTIALS: TableSchema =
    TableSchema::new("ssh_credentials", &["password", "private_key", "key_password"]);

pub const SENSITIVE_TABLES: [TableSchema; 3] = [USERS, SSH_DATA, SSH_CREDENTIALS];

pub fn table(name: &str) -> Option<&'static TableSchema> {
    SENSITIVE_TABLES.iter().find(|t| t.name == name)
}

pub fn verify_descriptors(conn: &Connection) -> Result<()> {
    SENSITIVE_TABLES.iter().try_for_each(|t| t.verify(conn))
}

pub const BASELINE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id              TEXT PRIMARY KEY,
    username        TEXT NOT NULL UNIQUE,
    password_hash   TEXT NOT NULL,
    is_admin        INTEGER NOT NULL DEFAULT 0,
    totp_secret     TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS settings (
    key     TEXT PRIMARY KEY,
    value   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ssh_credentials (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name            TEXT NOT NULL,
    username        TEXT NOT NULL,
    auth_type       TEXT NOT NULL DEFAULT 'password',
    password        TEXT,
    private_key     TEXT,
    key_password    TEXT,
    public_key      TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS ssh_data (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name            TEXT,
    ip              TEXT NOT NULL,
    port            INTEGER NOT NULL DEFAULT 22,
    username        TEXT NOT NULL,
    auth_type       TEXT NOT NULL DEFAULT 'password',
    password        TEXT,
    key             TEXT,
    key_password    TEXT,
    key_type        TEXT,
    folder          TEXT,
    tags            TEXT,
    pin             INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS user_keys (
    user_id         TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    salt            TEXT NOT NULL,
    wrapped_key     TEXT NOT NULL,
    iterations      INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
"#;

/// Columns added after the baseline shipped: (table, column, definition).
pub const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("users", "last_login", "TEXT"),
    ("ssh_data", "enable_terminal", "INTEGER NOT NULL DEFAULT 1"),
    ("ssh_data", "enable_file_manager", "INTEGER NOT NULL DEFAULT 1"),
    ("ssh_data", "credential_id", "INTEGER REFERENCES ssh_credentials(id)"),
    ("ssh_credentials", "usage_count", "INTEGER NOT NULL DEFAULT 0"),
];

pub fn apply_baseline(conn: &Connection) -> Result<()> {
    conn.execute_batch(BASELINE_SCHEMA)?;
    for (table, column, definition) in ADDITIVE_COLUMNS {
        crate::storage::migrator::ensure_column(conn, table, column, definition);
    }
    Ok(())
}

/// Tracked migrations, applied in id order after the baseline.
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            id: 1,
            name: "create_audit_log",
            up: Step::Sql(
                "CREATE TABLE audit_log (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id     TEXT,
                    action      TEXT NOT NULL,
                    detail      TEXT,
                    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
                );",
            ),
            down: Step::Sql("DROP TABLE audit_log;"),
        },
        Migration {
            id: 2,
            name: "index_hosts_by_user",
            up: Step::Sql(
                "CREATE INDEX idx_ssh_data_user ON ssh_data(user_id);
                 CREATE INDEX idx_ssh_credentials_user ON ssh_credentials(user_id);",
            ),
            down: Step::Sql(
                "DROP INDEX idx_ssh_credentials_user;
                 DROP INDEX idx_ssh_data_user;",
            ),
        },
        Migration {
            id: 3,
            name: "key_auth_type_for_key_hosts",
            up: Step::Code(|conn| {
                conn.execute(
                    "UPDATE ssh_data SET auth_type = 'key'
                     WHERE key IS NOT NULL AND key != '' AND auth_type = 'password'
                       AND (password IS NULL OR password = '')",
                    [],
                )
                .map(|_| ())
            }),
            down: Step::Sql(""),
        },
    ]
}
