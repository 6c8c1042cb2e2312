//! Process-wide system secrets: session-signing secret, database master key,
//! internal service token.
//!
//! Lookup order per secret: process environment, then the env file in the data
//! directory, then a freshly generated random value which is written back to the
//! env file (other entries preserved) so the next boot reads the same value.

use chrono::{DateTime, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroizing;

use crate::crypto::field::DataKey;
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    SessionSigning,
    MasterKey,
    InternalToken,
}

impl SecretKind {
    pub const ALL: [SecretKind; 3] = [
        SecretKind::SessionSigning,
        SecretKind::MasterKey,
        SecretKind::InternalToken,
    ];

    pub fn env_name(self) -> &'static str {
        match self {
            SecretKind::SessionSigning => "JWT_SECRET",
            SecretKind::MasterKey => "DATABASE_KEY",
            SecretKind::InternalToken => "INTERNAL_AUTH_TOKEN",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "session_signing" | "jwt_secret" | "JWT_SECRET" => Some(SecretKind::SessionSigning),
            "master_key" | "database_key" | "DATABASE_KEY" => Some(SecretKind::MasterKey),
            "internal_token" | "INTERNAL_AUTH_TOKEN" => Some(SecretKind::InternalToken),
            _ => None,
        }
    }

    pub fn min_len(self) -> usize {
        match self {
            SecretKind::SessionSigning => 64,
            SecretKind::MasterKey => 64,
            SecretKind::InternalToken => 32,
        }
    }

    fn accepts(self, value: &str) -> bool {
        if value.len() < self.min_len() {
            return false;
        }
        match self {
            SecretKind::MasterKey => {
                value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
            }
            _ => true,
        }
    }

    fn generate(self) -> String {
        let mut raw = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(raw.as_mut());
        hex::encode(raw.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretState {
    Uninitialized,
    Generated,
    Persisted,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretOrigin {
    /// Adopted from the process environment; read-only.
    Environment,
    EnvFile,
    Generated,
}

#[derive(Clone)]
pub struct SystemSecret {
    pub kind: SecretKind,
    value: Zeroizing<String>,
    pub created_at: DateTime<Utc>,
    pub origin: SecretOrigin,
    /// False when a generated value could not be written to the env file
    pub persisted: bool,
}

impl SystemSecret {
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for SystemSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSecret")
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SecretPolicy {
    /// Generated secrets must reach the env file or initialization fails
    pub persistence_required: bool,
    /// An environment value below minimum length is an error instead of being ignored
    pub reject_weak_env: bool,
    /// Export loaded/generated values into the running process environment
    pub export_to_process: bool,
}

pub struct SecretStore {
    env: HashMap<String, String>,
    env_file: PathBuf,
    policy: SecretPolicy,
    secrets: Mutex<HashMap<SecretKind, SystemSecret>>,
}

impl SecretStore {
    /// `env` is a snapshot of the variables to consult before the env file.
    pub fn new(env: HashMap<String, String>, env_file: PathBuf, policy: SecretPolicy) -> Self {
        Self {
            env,
            env_file,
            policy,
            secrets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_process_env(env_file: PathBuf, mut policy: SecretPolicy) -> Self {
        policy.export_to_process = true;
        let env = SecretKind::ALL
            .iter()
            .filter_map(|k| std::env::var(k.env_name()).ok().map(|v| (k.env_name().to_string(), v)))
            .collect();
        Self::new(env, env_file, policy)
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    pub fn state(&self, kind: SecretKind) -> SecretState {
        let secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        match secrets.get(&kind) {
            None => SecretState::Uninitialized,
            Some(s) if s.origin != SecretOrigin::Generated => SecretState::Loaded,
            Some(s) if s.persisted => SecretState::Persisted,
            Some(_) => SecretState::Generated,
        }
    }

    pub fn initialize_all(&self) -> Result<()> {
        for kind in SecretKind::ALL {
            self.initialize(kind)?;
        }
        Ok(())
    }

    /// Idempotent; the first successful call fixes the value for this store.
    pub fn initialize(&self, kind: SecretKind) -> Result<SystemSecret> {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = secrets.get(&kind) {
            return Ok(existing.clone());
        }

        let name = kind.env_name();
        if let Some(value) = self.env.get(name) {
            if kind.accepts(value) {
                tracing::info!(secret = name, "using secret from environment");
                let secret = self.adopt(kind, value.clone(), SecretOrigin::Environment);
                secrets.insert(kind, secret.clone());
                return Ok(secret);
            }
            if self.policy.reject_weak_env {
                return Err(StoreError::key_init(
                    name,
                    format!("environment value shorter than {} characters or malformed", kind.min_len()),
                ));
            }
            tracing::warn!(secret = name, "ignoring weak secret from environment");
        }

        if let Some(value) = read_env_file_value(&self.env_file, name)? {
            if kind.accepts(&value) {
                tracing::debug!(secret = name, path = %self.env_file.display(), "using secret from env file");
                let secret = self.adopt(kind, value, SecretOrigin::EnvFile);
                secrets.insert(kind, secret.clone());
                return Ok(secret);
            }
            tracing::warn!(secret = name, path = %self.env_file.display(), "ignoring weak secret in env file");
        }

        let secret = self.generate(kind)?;
        secrets.insert(kind, secret.clone());
        Ok(secret)
    }

    /// Resolve a secret from the environment or env file without generating,
    /// persisting or exporting anything. `None` when neither holds a usable value.
    pub fn lookup(&self, kind: SecretKind) -> Result<Option<SystemSecret>> {
        if let Some(existing) = self.secrets.lock().unwrap_or_else(|e| e.into_inner()).get(&kind) {
            return Ok(Some(existing.clone()));
        }
        let name = kind.env_name();
        let found = match self.env.get(name) {
            Some(v) if kind.accepts(v) => Some((v.clone(), SecretOrigin::Environment)),
            _ => read_env_file_value(&self.env_file, name)?
                .filter(|v| kind.accepts(v))
                .map(|v| (v, SecretOrigin::EnvFile)),
        };
        Ok(found.map(|(value, origin)| SystemSecret {
            kind,
            value: Zeroizing::new(value),
            created_at: Utc::now(),
            origin,
            persisted: true,
        }))
    }

    /// [`initialize`](Self::initialize) by name, e.g. `"master_key"` or `"JWT_SECRET"`.
    pub fn initialize_named(&self, name: &str) -> Result<SystemSecret> {
        let kind = SecretKind::from_name(name).ok_or_else(|| StoreError::key_init(name, "unknown secret"))?;
        self.initialize(kind)
    }

    /// Lazily initializes on first access.
    pub fn get(&self, kind: SecretKind) -> Result<SystemSecret> {
        self.initialize(kind)
    }

    pub fn master_key(&self) -> Result<DataKey> {
        DataKey::from_hex(self.get(SecretKind::MasterKey)?.value())
    }

    /// Replace a generated or file-sourced secret with a new random value.
    /// Environment-provided secrets are read-only.
    pub fn regenerate(&self, kind: SecretKind) -> Result<SystemSecret> {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(secrets.get(&kind), Some(s) if s.origin == SecretOrigin::Environment) {
            return Err(StoreError::key_init(
                kind.env_name(),
                "secret is provided by the environment and cannot be regenerated",
            ));
        }
        let secret = self.generate(kind)?;
        secrets.insert(kind, secret.clone());
        Ok(secret)
    }

    fn adopt(&self, kind: SecretKind, value: String, origin: SecretOrigin) -> SystemSecret {
        if origin == SecretOrigin::EnvFile {
            self.export(kind, &value);
        }
        SystemSecret {
            kind,
            value: Zeroizing::new(value),
            created_at: Utc::now(),
            origin,
            persisted: origin != SecretOrigin::Generated,
        }
    }

    fn generate(&self, kind: SecretKind) -> Result<SystemSecret> {
        let name = kind.env_name();
        let value = kind.generate();
        let persisted = match upsert_env_file(&self.env_file, name, &value) {
            Ok(()) => {
                tracing::warn!(
                    secret = name,
                    path = %self.env_file.display(),
                    "generated new secret and saved it to env file; back this file up"
                );
                true
            }
            Err(e) if self.policy.persistence_required => {
                return Err(StoreError::key_init(
                    name,
                    format!("could not persist generated secret to {}: {e}", self.env_file.display()),
                ));
            }
            Err(e) => {
                tracing::warn!(
                    secret = name,
                    path = %self.env_file.display(),
                    error = %e,
                    "generated secret could not be persisted; valid for this process only"
                );
                false
            }
        };
        self.export(kind, &value);
        Ok(SystemSecret {
            kind,
            value: Zeroizing::new(value),
            created_at: Utc::now(),
            origin: SecretOrigin::Generated,
            persisted,
        })
    }

    fn export(&self, kind: SecretKind, value: &str) {
        if self.policy.export_to_process {
            std::env::set_var(kind.env_name(), value);
        }
    }
}

fn read_env_file_value(path: &Path, key: &str) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let iter = dotenv::from_path_iter(path)
        .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
    for item in iter {
        match item {
            Ok((k, v)) if k == key => return Ok(Some(v)),
            Ok(_) => {}
            Err(dotenv::Error::LineParse(line, idx)) => {
                tracing::warn!(path = %path.display(), line = %line, idx, "skipping malformed env file line")
            }
            Err(e) => return Err(StoreError::Config(format!("{}: {e}", path.display()))),
        }
    }
    Ok(None)
}

/// Set `key=value` in the env file, replacing an existing assignment in place
/// and keeping every other line untouched.
pub fn upsert_env_file(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let existing = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let assignment = format!("{key}={value}");
    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let bare = line.trim_start().trim_start_matches("export ").trim_start();
            if !replaced && bare.starts_with(&format!("{key}=")) {
                replaced = true;
                assignment.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(assignment);
    }

    let tmp = path.with_extension("tmp");
    match std::fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    {
        let mut f = create_private(&tmp)?;
        f.write_all(lines.join("\n").as_bytes())?;
        f.write_all(b"\n")?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// New file readable only by the owner from the moment it exists.
pub(crate) fn create_private(path: &Path) -> std::io::Result<std::fs::File> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, env: &[(&str, &str)], policy: SecretPolicy) -> SecretStore {
        let env = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SecretStore::new(env, dir.join(".env"), policy)
    }

    #[test]
    fn generated_master_key_is_reused_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = store(dir.path(), &[], SecretPolicy::default());
        assert_eq!(first.state(SecretKind::MasterKey), SecretState::Uninitialized);
        let a = first.initialize(SecretKind::MasterKey).unwrap();
        assert_eq!(a.origin, SecretOrigin::Generated);
        assert_eq!(first.state(SecretKind::MasterKey), SecretState::Persisted);
        assert_eq!(first.initialize(SecretKind::MasterKey).unwrap().value(), a.value());

        let second = store(dir.path(), &[], SecretPolicy::default());
        let b = second.initialize(SecretKind::MasterKey).unwrap();
        assert_eq!(b.origin, SecretOrigin::EnvFile);
        assert_eq!(a.value(), b.value());
        assert!(second.master_key().is_ok());
    }

    #[test]
    fn environment_value_wins_and_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let key = "a".repeat(64);
        let s = store(dir.path(), &[("DATABASE_KEY", &key)], SecretPolicy::default());
        assert_eq!(s.get(SecretKind::MasterKey).unwrap().value(), key);
        assert!(!dir.path().join(".env").exists());
        assert!(s.regenerate(SecretKind::MasterKey).is_err());
    }

    #[test]
    fn weak_environment_value_is_fatal_when_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SecretPolicy {
            reject_weak_env: true,
            ..Default::default()
        };
        let s = store(dir.path(), &[("JWT_SECRET", "short")], policy);
        assert!(matches!(
            s.initialize(SecretKind::SessionSigning),
            Err(StoreError::KeyInitialization { .. })
        ));
    }

    #[test]
    fn weak_environment_value_is_replaced_otherwise() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), &[("DATABASE_KEY", "not-hex")], SecretPolicy::default());
        let v = s.get(SecretKind::MasterKey).unwrap();
        assert_eq!(v.origin, SecretOrigin::Generated);
        assert_eq!(v.value().len(), 64);
    }

    #[test]
    fn secrets_can_be_initialized_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), &[], SecretPolicy::default());
        let by_name = s.initialize_named("master_key").unwrap();
        assert_eq!(by_name.value(), s.get(SecretKind::MasterKey).unwrap().value());
        assert_eq!(
            s.initialize_named("JWT_SECRET").unwrap().value(),
            s.get(SecretKind::SessionSigning).unwrap().value()
        );
        assert!(matches!(
            s.initialize_named("smtp_password"),
            Err(StoreError::KeyInitialization { .. })
        ));
    }

    #[test]
    fn lookup_never_generates() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), &[], SecretPolicy::default());
        assert!(s.lookup(SecretKind::MasterKey).unwrap().is_none());
        assert!(!dir.path().join(".env").exists());
        assert_eq!(s.state(SecretKind::MasterKey), SecretState::Uninitialized);

        let generated = s.initialize(SecretKind::MasterKey).unwrap();
        let fresh = store(dir.path(), &[], SecretPolicy::default());
        let found = fresh.lookup(SecretKind::MasterKey).unwrap().unwrap();
        assert_eq!(found.value(), generated.value());
        assert_eq!(found.origin, SecretOrigin::EnvFile);
        assert_eq!(fresh.state(SecretKind::MasterKey), SecretState::Uninitialized);
    }

    #[cfg(unix)]
    #[test]
    fn env_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        // a stale temp file from an interrupted write must not leak its mode
        std::fs::write(path.with_extension("tmp"), b"stale").unwrap();
        std::fs::set_permissions(path.with_extension("tmp"), std::fs::Permissions::from_mode(0o644)).unwrap();
        upsert_env_file(&path, "DATABASE_KEY", "k").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn env_file_update_preserves_other_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".env");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "# comment\nPORT=8080\nJWT_SECRET=old\n").unwrap();
        upsert_env_file(&path, "JWT_SECRET", "new").unwrap();
        upsert_env_file(&path, "DATABASE_KEY", "k").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "# comment\nPORT=8080\nJWT_SECRET=new\nDATABASE_KEY=k\n");
    }

    #[test]
    fn unwritable_env_file_is_fatal_only_when_required() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the data directory should be makes every write fail
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let lenient = store(&blocked, &[], SecretPolicy::default());
        let s = lenient.initialize(SecretKind::InternalToken).unwrap();
        assert!(!s.persisted);
        assert_eq!(lenient.state(SecretKind::InternalToken), SecretState::Generated);

        let strict = store(
            &blocked,
            &[],
            SecretPolicy {
                persistence_required: true,
                ..Default::default()
            },
        );
        assert!(strict.initialize(SecretKind::InternalToken).is_err());
    }
}
