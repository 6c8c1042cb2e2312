//! Keys, fingerprints and authenticated encryption.

pub mod field;
pub mod fingerprint;
pub mod secrets;
pub mod user;

pub use field::{DataKey, EncryptedField, FieldCipher};
pub use fingerprint::{Fingerprint, FingerprintSource, HardwareFingerprint};
pub use secrets::{SecretKind, SecretPolicy, SecretStore};
pub use user::{FieldPolicy, KeyVault, Record, UserDataCrypto, UserKeyRing};
