//! Tracked, transactional schema migrations plus the forward-only
//! "ensure column" helper used outside the migration ledger.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

use crate::error::{Result, StoreError};

pub const MIGRATIONS_TABLE: &str = "schema_migrations";

pub type MigrationFn = fn(&Connection) -> rusqlite::Result<()>;

#[derive(Clone, Copy)]
pub enum Step {
    Sql(&'static str),
    Code(MigrationFn),
}

impl Step {
    fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            Step::Sql(sql) => conn.execute_batch(sql),
            Step::Code(f) => f(conn),
        }
    }
}

#[derive(Clone, Copy)]
pub struct Migration {
    pub id: u32,
    pub name: &'static str,
    pub up: Step,
    pub down: Step,
}

impl Migration {
    /// Zero-padded so lexicographic and numeric order agree.
    pub fn padded_id(&self) -> String {
        pad_id(self.id)
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Migration({} {})", self.padded_id(), self.name)
    }
}

pub fn pad_id(id: u32) -> String {
    format!("{id:04}")
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MigrationRecord {
    pub id: String,
    pub name: String,
    pub applied_at: String,
}

pub struct SchemaMigrator {
    migrations: Vec<Migration>,
}

impl SchemaMigrator {
    /// Sorts by id and rejects duplicates or ids that do not fit the padding.
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by_key(|m| m.id);
        let mut seen = HashSet::new();
        for m in &migrations {
            if m.id == 0 || m.id > 9999 {
                return Err(StoreError::Migration(format!("migration id {} out of range", m.id)));
            }
            if !seen.insert(m.id) {
                return Err(StoreError::Migration(format!("duplicate migration id {}", m.padded_id())));
            }
        }
        Ok(Self { migrations })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(crate::storage::schema::migrations())
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    fn ensure_table(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                applied_at  TEXT NOT NULL
            )"
        ))?;
        Ok(())
    }

    pub fn applied(&self, conn: &Connection) -> Result<Vec<MigrationRecord>> {
        Self::ensure_table(conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, applied_at FROM {MIGRATIONS_TABLE} ORDER BY id"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(MigrationRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                applied_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn pending(&self, conn: &Connection) -> Result<Vec<Migration>> {
        let applied: HashSet<String> = self.applied(conn)?.into_iter().map(|r| r.id).collect();
        Ok(self
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.padded_id()))
            .copied()
            .collect())
    }

    /// Apply every pending migration in one transaction. Any failure rolls the
    /// whole batch back. Returns the ids applied.
    pub fn run_migrations(&self, conn: &mut Connection) -> Result<Vec<String>> {
        let pending = self.pending(conn)?;
        if pending.is_empty() {
            tracing::debug!("schema up to date");
            return Ok(Vec::new());
        }

        let tx = conn.transaction()?;
        let mut done = Vec::with_capacity(pending.len());
        for m in &pending {
            tracing::info!(id = %m.padded_id(), name = m.name, "applying migration");
            m.up.apply(&tx).map_err(|e| {
                StoreError::Migration(format!("{} {} failed: {e}", m.padded_id(), m.name))
            })?;
            tx.execute(
                &format!("INSERT INTO {MIGRATIONS_TABLE} (id, name, applied_at) VALUES (?1, ?2, ?3)"),
                params![m.padded_id(), m.name, Utc::now().to_rfc3339()],
            )?;
            done.push(m.padded_id());
        }
        tx.commit()?;
        tracing::info!(count = done.len(), "migrations applied");
        Ok(done)
    }

    /// Without a target, revert only the latest applied migration; with one,
    /// revert every applied migration whose id is >= target, newest first.
    pub fn rollback(&self, conn: &mut Connection, target: Option<u32>) -> Result<Vec<String>> {
        let applied = self.applied(conn)?;
        let mut to_revert: Vec<&MigrationRecord> = match target {
            None => applied.last().into_iter().collect(),
            Some(t) => {
                let floor = pad_id(t);
                applied.iter().filter(|r| r.id >= floor).collect()
            }
        };
        to_revert.sort_by(|a, b| b.id.cmp(&a.id));
        if to_revert.is_empty() {
            return Ok(Vec::new());
        }

        let tx = conn.transaction()?;
        let mut reverted = Vec::with_capacity(to_revert.len());
        for record in to_revert {
            let m = self
                .migrations
                .iter()
                .find(|m| m.padded_id() == record.id)
                .ok_or_else(|| {
                    StoreError::Migration(format!("no registered migration for applied id {}", record.id))
                })?;
            tracing::info!(id = %record.id, name = m.name, "reverting migration");
            m.down.apply(&tx).map_err(|e| {
                StoreError::Migration(format!("{} {} rollback failed: {e}", record.id, m.name))
            })?;
            tx.execute(
                &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE id = ?1"),
                params![record.id],
            )?;
            reverted.push(record.id.clone());
        }
        tx.commit()?;
        Ok(reverted)
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Add `column` to `table` unless a trivial read of it already succeeds.
/// Returns true when the column was added. Failures are warnings only.
pub fn ensure_column(conn: &Connection, table: &str, column: &str, definition: &str) -> bool {
    let probe = format!("SELECT {} FROM {} LIMIT 1", quote_ident(column), quote_ident(table));
    let exists = conn
        .query_row(&probe, [], |_| Ok(()))
        .optional()
        .is_ok();
    if exists {
        return false;
    }
    let alter = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_ident(table),
        quote_ident(column),
        definition
    );
    match conn.execute_batch(&alter) {
        Ok(()) => {
            tracing::info!(table, column, "added column");
            true
        }
        Err(e) => {
            tracing::warn!(table, column, error = %e, "could not add column");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    fn sample() -> Vec<Migration> {
        vec![
            Migration {
                id: 2,
                name: "b",
                up: Step::Sql("CREATE TABLE b (x INTEGER);"),
                down: Step::Sql("DROP TABLE b;"),
            },
            Migration {
                id: 1,
                name: "a",
                up: Step::Sql("CREATE TABLE a (x INTEGER);"),
                down: Step::Sql("DROP TABLE a;"),
            },
            Migration {
                id: 10,
                name: "c",
                up: Step::Code(|c| c.execute_batch("CREATE TABLE c (x INTEGER);")),
                down: Step::Sql("DROP TABLE c;"),
            },
        ]
    }

    #[test]
    fn applies_in_order_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        let m = SchemaMigrator::new(sample()).unwrap();
        assert_eq!(m.run_migrations(&mut conn).unwrap(), vec!["0001", "0002", "0010"]);
        assert!(m.run_migrations(&mut conn).unwrap().is_empty());
        let ids: Vec<String> = m.applied(&conn).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["0001", "0002", "0010"]);
    }

    #[test]
    fn failing_unit_rolls_back_whole_batch() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut units = sample();
        units.push(Migration {
            id: 11,
            name: "broken",
            up: Step::Sql("CREATE TABLE nope (;"),
            down: Step::Sql(""),
        });
        let m = SchemaMigrator::new(units).unwrap();
        assert!(matches!(m.run_migrations(&mut conn), Err(StoreError::Migration(_))));
        assert!(!table_exists(&conn, "a"));
        assert!(m.applied(&conn).unwrap().is_empty());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut units = sample();
        units.push(units[0]);
        assert!(SchemaMigrator::new(units).is_err());
    }

    #[test]
    fn rollback_latest_and_to_target() {
        let mut conn = Connection::open_in_memory().unwrap();
        let m = SchemaMigrator::new(sample()).unwrap();
        m.run_migrations(&mut conn).unwrap();

        assert_eq!(m.rollback(&mut conn, None).unwrap(), vec!["0010"]);
        assert!(!table_exists(&conn, "c"));
        assert!(table_exists(&conn, "b"));

        m.run_migrations(&mut conn).unwrap();
        assert_eq!(m.rollback(&mut conn, Some(2)).unwrap(), vec!["0010", "0002"]);
        assert!(table_exists(&conn, "a"));
        assert!(!table_exists(&conn, "b"));
        assert_eq!(m.pending(&conn).unwrap().len(), 2);
    }

    #[test]
    fn ensure_column_adds_once() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        assert!(ensure_column(&conn, "t", "extra", "TEXT DEFAULT 'x'"));
        assert!(!ensure_column(&conn, "t", "extra", "TEXT DEFAULT 'x'"));
        assert!(!ensure_column(&conn, "missing_table", "extra", "TEXT"));
    }
}
