//! File layout inside the data directory.

use chrono::Utc;
use std::path::{Path, PathBuf};

pub const PLAINTEXT_DB: &str = "db.sqlite";
pub const ENCRYPTED_DB: &str = "db.sqlite.encrypted";
pub const BACKUP_PREFIX: &str = "db.sqlite.backup-";
pub const MIGRATED_PREFIX: &str = "db.sqlite.migrated-";
pub const UNREADABLE_PREFIX: &str = "db.sqlite.encrypted.unreadable-";

/// Timestamp suffix for migration artifacts; sorts lexicographically.
pub fn artifact_timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string()
}

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pre-encryption database file.
    pub fn plaintext(&self) -> PathBuf {
        self.root.join(PLAINTEXT_DB)
    }

    pub fn encrypted(&self) -> PathBuf {
        self.root.join(ENCRYPTED_DB)
    }

    pub fn backup(&self, ts: &str) -> PathBuf {
        self.root.join(format!("{BACKUP_PREFIX}{ts}"))
    }

    pub fn migrated(&self, ts: &str) -> PathBuf {
        self.root.join(format!("{MIGRATED_PREFIX}{ts}"))
    }

    pub fn unreadable(&self, ts: &str) -> PathBuf {
        self.root.join(format!("{UNREADABLE_PREFIX}{ts}"))
    }

    /// Files in the data directory whose name starts with `prefix`, newest first.
    pub fn artifacts(&self, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if !self.root.is_dir() {
            return Ok(found);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(prefix) && entry.file_type()?.is_file() {
                found.push(entry.path());
            }
        }
        found.sort();
        found.reverse();
        Ok(found)
    }
}
