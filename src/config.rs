//! Store configuration. Defaults, then an optional JSON file, then environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const FILE_ENCRYPTION_ENV: &str = "DB_FILE_ENCRYPTION";
pub const FILE_ENCRYPTION_REQUIRED_ENV: &str = "DB_FILE_ENCRYPTION_REQUIRED";
pub const FINGERPRINT_SEED_ENV: &str = "HARDWARE_FINGERPRINT_SEED";
pub const SECRETS_PERSISTENCE_REQUIRED_ENV: &str = "SECRETS_PERSISTENCE_REQUIRED";
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory (env file, encrypted database, migration artifacts)
    pub data_dir: PathBuf,
    pub encryption: EncryptionConfig,
    pub flush: FlushConfig,
    pub secrets: SecretsConfig,
    /// Idle timeout for unlocked user data keys (seconds)
    pub session_idle_secs: u64,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Keep the database in memory and persist it as one encrypted file
    pub file_encryption: bool,
    /// Abort startup instead of falling back when the encrypted file cannot be opened
    pub required: bool,
    /// Embed a hardware check value in the encrypted file
    pub hardware_binding: bool,
    /// Explicit fingerprint seed (>= 32 chars); replaces host probing when set
    #[serde(skip_serializing)]
    pub fingerprint_seed: Option<String>,
    /// Refuse plaintext values in sensitive columns on decrypt
    pub strict_fields: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Unconditional flush period (seconds)
    pub interval_secs: u64,
    /// Quiet period after a write before the triggered flush runs (milliseconds)
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Name of the env file inside the data directory
    pub env_file: String,
    /// Fail startup when a generated secret cannot be written to the env file
    pub persistence_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            encryption: EncryptionConfig::default(),
            flush: FlushConfig::default(),
            secrets: SecretsConfig::default(),
            session_idle_secs: 24 * 60 * 60,
            log: LogConfig::default(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            file_encryption: true,
            required: false,
            hardware_binding: true,
            fingerprint_seed: None,
            strict_fields: false,
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            debounce_ms: 2_000,
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            env_file: ".env".to_string(),
            persistence_required: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("sealdb"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// Parse the boolean spellings accepted in environment variables.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl StoreConfig {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<StoreConfig>(&data) {
                    Ok(c) => return c,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "invalid config file; using defaults")
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable config file; using defaults")
                }
            }
        }
        Self::default()
    }

    /// Apply overrides from a variable lookup (normally `std::env::var`).
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup(FILE_ENCRYPTION_ENV).as_deref().and_then(parse_bool) {
            self.encryption.file_encryption = v;
        }
        if let Some(v) = lookup(FILE_ENCRYPTION_REQUIRED_ENV)
            .as_deref()
            .and_then(parse_bool)
        {
            self.encryption.required = v;
        }
        if let Some(seed) = lookup(FINGERPRINT_SEED_ENV).filter(|v| !v.is_empty()) {
            self.encryption.fingerprint_seed = Some(seed);
        }
        if let Some(v) = lookup(SECRETS_PERSISTENCE_REQUIRED_ENV)
            .as_deref()
            .and_then(parse_bool)
        {
            self.secrets.persistence_required = v;
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV).filter(|v| !v.is_empty()) {
            self.log.level = level;
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            self.log.json = !format.eq_ignore_ascii_case("pretty");
        }
        self
    }

    /// Defaults, then `path`, then the process environment.
    pub fn from_env(path: &Path) -> Self {
        Self::load(path).apply_env(|k| std::env::var(k).ok())
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.data_dir.join(&self.secrets.env_file)
    }
}
