//! Per-user envelope encryption of sensitive columns.
//!
//! Each user owns a random data key (DEK). The DEK is stored only wrapped under
//! a key derived from the user's password, and lives unwrapped in the
//! [`UserKeyRing`] between login and logout (or idle expiry).

use chrono::Utc;
use rand::RngCore;
use ring::pbkdf2;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

use crate::crypto::field::{DataKey, EncryptedField, FieldCipher, KEY_LEN};
use crate::error::{Result, StoreError};
use crate::storage::schema::TableSchema;

pub type Record = serde_json::Map<String, Value>;

pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 32;
const WRAP_FIELD: &str = "user_keys.dek";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldPolicy {
    /// Plaintext values in sensitive columns pass through on read
    #[default]
    Optional,
    /// Plaintext in a sensitive column is an error
    Strict,
}

fn record_id(table: &TableSchema, record: &Record) -> Result<String> {
    match record.get(table.id_column) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(StoreError::MissingRecordId),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserDataCrypto {
    policy: FieldPolicy,
}

impl UserDataCrypto {
    pub fn new(policy: FieldPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FieldPolicy {
        self.policy
    }

    /// Encrypt the table's sensitive string fields. Null, empty and already
    /// encrypted values are left as they are; other fields are never touched.
    pub fn encrypt_record(&self, table: &TableSchema, record: &Record, key: &DataKey) -> Result<Record> {
        let mut out = record.clone();
        let mut id: Option<String> = None;
        for field in table.sensitive {
            let Some(Value::String(plain)) = out.get(*field) else {
                continue;
            };
            if plain.is_empty() || FieldCipher::is_encrypted(plain) {
                continue;
            }
            if id.is_none() {
                id = Some(record_id(table, record)?);
            }
            let rid = id.as_deref().unwrap_or_default();
            let sealed = FieldCipher::encrypt(plain, key, rid, &format!("{}.{field}", table.name))?;
            out.insert((*field).to_string(), Value::String(sealed.into_string()));
        }
        Ok(out)
    }

    pub fn decrypt_record(&self, table: &TableSchema, record: &Record, key: &DataKey) -> Result<Record> {
        let mut out = record.clone();
        let mut id: Option<String> = None;
        for field in table.sensitive {
            let Some(Value::String(stored)) = out.get(*field) else {
                continue;
            };
            let Some(sealed) = EncryptedField::parse(stored) else {
                if self.policy == FieldPolicy::Strict && !stored.is_empty() {
                    return Err(StoreError::UnencryptedField {
                        table: table.name.to_string(),
                        field: (*field).to_string(),
                    });
                }
                continue;
            };
            if id.is_none() {
                id = Some(record_id(table, record)?);
            }
            let rid = id.as_deref().unwrap_or_default();
            let plain = FieldCipher::decrypt(&sealed, key, rid, &format!("{}.{field}", table.name))?;
            out.insert((*field).to_string(), Value::String(plain));
        }
        Ok(out)
    }
}

struct UnlockedKey {
    key: DataKey,
    last_used: Instant,
}

/// Unwrapped user keys, held only in memory. Dropped entries are zeroized.
pub struct UserKeyRing {
    idle: Duration,
    keys: Mutex<HashMap<String, UnlockedKey>>,
}

impl UserKeyRing {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn keys(&self) -> std::sync::MutexGuard<'_, HashMap<String, UnlockedKey>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, user_id: &str, key: DataKey) {
        self.keys().insert(
            user_id.to_string(),
            UnlockedKey {
                key,
                last_used: Instant::now(),
            },
        );
    }

    /// Returns the key and refreshes its idle timer; an expired key is dropped.
    pub fn get(&self, user_id: &str) -> Option<DataKey> {
        let mut keys = self.keys();
        let now = Instant::now();
        let expired = match keys.get_mut(user_id) {
            None => return None,
            Some(entry) if now.duration_since(entry.last_used) >= self.idle => true,
            Some(entry) => {
                entry.last_used = now;
                return Some(entry.key.clone());
            }
        };
        if expired {
            keys.remove(user_id);
            tracing::info!(user_id, "user data key expired");
        }
        None
    }

    pub fn is_unlocked(&self, user_id: &str) -> bool {
        self.get(user_id).is_some()
    }

    pub fn remove(&self, user_id: &str) -> bool {
        self.keys().remove(user_id).is_some()
    }

    /// Drop every idle key; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut keys = self.keys();
        let before = keys.len();
        keys.retain(|_, k| now.duration_since(k.last_used) < self.idle);
        before - keys.len()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Password-wrapped user keys in the `user_keys` table.
#[derive(Debug, Clone, Copy)]
pub struct KeyVault {
    iterations: NonZeroU32,
}

impl Default for KeyVault {
    fn default() -> Self {
        Self::new(DEFAULT_KDF_ITERATIONS)
    }
}

impl KeyVault {
    /// Zero is raised to one.
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN),
        }
    }

    fn derive(password: &str, salt: &[u8], iterations: NonZeroU32) -> DataKey {
        let mut out = [0u8; KEY_LEN];
        pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, salt, password.as_bytes(), &mut out);
        DataKey::from_bytes(out)
    }

    fn wrap(&self, user_id: &str, password: &str, dek: &DataKey) -> Result<(String, String)> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let kek = Self::derive(password, &salt, self.iterations);
        let dek_hex = Zeroizing::new(hex::encode(dek.as_bytes()));
        let wrapped = FieldCipher::encrypt(&dek_hex, &kek, user_id, WRAP_FIELD)?;
        Ok((hex::encode(salt), wrapped.into_string()))
    }

    pub fn has_user_key(&self, conn: &Connection, user_id: &str) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM user_keys WHERE user_id = ?1", params![user_id], |r| r.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Create and store a fresh data key for a user who has none yet.
    pub fn setup_user(&self, conn: &Connection, user_id: &str, password: &str) -> Result<DataKey> {
        if self.has_user_key(conn, user_id)? {
            return Err(StoreError::Config(format!("user {user_id} already has a data key")));
        }
        let dek = DataKey::generate();
        let (salt, wrapped) = self.wrap(user_id, password, &dek)?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO user_keys (user_id, salt, wrapped_key, iterations, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![user_id, salt, wrapped, self.iterations.get(), now],
        )?;
        tracing::info!(user_id, "user data key created");
        Ok(dek)
    }

    /// Unwrap the stored key. A wrong password is an authentication failure.
    pub fn unlock(&self, conn: &Connection, user_id: &str, password: &str) -> Result<DataKey> {
        let row: Option<(String, String, u32)> = conn
            .query_row(
                "SELECT salt, wrapped_key, iterations FROM user_keys WHERE user_id = ?1",
                params![user_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let (salt, wrapped, iterations) = row.ok_or_else(|| StoreError::UserLocked(user_id.to_string()))?;
        let salt = hex::decode(&salt).map_err(|e| StoreError::InvalidFormat(format!("salt: {e}")))?;
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| StoreError::InvalidFormat("stored iteration count is zero".into()))?;
        let sealed = EncryptedField::parse(&wrapped)
            .ok_or_else(|| StoreError::InvalidFormat("wrapped key is not an encrypted value".into()))?;
        let kek = Self::derive(password, &salt, iterations);
        let dek_hex = Zeroizing::new(FieldCipher::decrypt(&sealed, &kek, user_id, WRAP_FIELD)?);
        DataKey::from_hex(&dek_hex)
    }

    /// Rewrap under a new password. Data encrypted with the key is unaffected.
    pub fn change_password(&self, conn: &Connection, user_id: &str, old: &str, new: &str) -> Result<DataKey> {
        let dek = self.unlock(conn, user_id, old)?;
        let (salt, wrapped) = self.wrap(user_id, new, &dek)?;
        conn.execute(
            "UPDATE user_keys SET salt = ?2, wrapped_key = ?3, iterations = ?4, updated_at = ?5
             WHERE user_id = ?1",
            params![user_id, salt, wrapped, self.iterations.get(), Utc::now().to_rfc3339()],
        )?;
        tracing::info!(user_id, "user data key rewrapped");
        Ok(dek)
    }
}
