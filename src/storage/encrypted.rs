//! Whole-database encrypted file.
//!
//! Layout: magic (8) | flags (1) | hardware check (32, only when bound) |
//! nonce (12) | AES-256-GCM ciphertext || tag. Everything before the nonce is
//! authenticated as associated data. The file key is derived from the master
//! key with HKDF-SHA256, salted with the host fingerprint when bound, so a
//! bound file cannot be opened on another host even with the master key.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm,
};
use rand::RngCore;
use ring::hkdf;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::crypto::field::{DataKey, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::crypto::fingerprint::HardwareFingerprint;
use crate::crypto::secrets::create_private;
use crate::error::{Result, StoreError};

pub const MAGIC: &[u8; 8] = b"SEALDB\0\x01";
const FLAG_HARDWARE_BOUND: u8 = 0x01;
const CHECK_LEN: usize = 32;
const KDF_INFO: &[u8] = b"sealdb-file-key-v1";
const CHECK_DOMAIN: &[u8] = b"sealdb-hardware-check-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub hardware_bound: bool,
    pub header_len: usize,
}

impl FileHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MAGIC.len() + 1 || &bytes[..MAGIC.len()] != MAGIC {
            return Err(StoreError::InvalidFormat("not an encrypted database file".into()));
        }
        let flags = bytes[MAGIC.len()];
        if flags & !FLAG_HARDWARE_BOUND != 0 {
            return Err(StoreError::InvalidFormat(format!("unknown flags {flags:#04x}")));
        }
        let hardware_bound = flags & FLAG_HARDWARE_BOUND != 0;
        let header_len = MAGIC.len() + 1 + if hardware_bound { CHECK_LEN } else { 0 };
        if bytes.len() < header_len + NONCE_LEN + TAG_LEN {
            return Err(StoreError::InvalidFormat("file truncated".into()));
        }
        Ok(Self {
            hardware_bound,
            header_len,
        })
    }
}

#[derive(Clone)]
pub struct DatabaseFile {
    fingerprint: Arc<HardwareFingerprint>,
}

impl DatabaseFile {
    pub fn new(fingerprint: Arc<HardwareFingerprint>) -> Self {
        Self { fingerprint }
    }

    fn hardware_check(&self) -> [u8; CHECK_LEN] {
        let mut h = Sha256::new();
        h.update(CHECK_DOMAIN);
        h.update(self.fingerprint.generate().digest.as_bytes());
        h.finalize().into()
    }

    fn file_key(&self, master: &DataKey, bound: bool) -> Result<DataKey> {
        let salt_bytes = if bound {
            self.fingerprint.generate().digest_bytes()
        } else {
            Vec::new()
        };
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt_bytes);
        let prk = salt.extract(master.as_bytes());
        let mut out = [0u8; KEY_LEN];
        prk.expand(&[KDF_INFO], hkdf::HKDF_SHA256)
            .map_err(|_| StoreError::InvalidFormat("HKDF expansion failed".into()))?
            .fill(&mut out)
            .map_err(|_| StoreError::InvalidFormat("HKDF fill failed".into()))?;
        Ok(DataKey::from_bytes(out))
    }

    /// Encrypt a raw database image in memory.
    pub fn seal(&self, buffer: &[u8], master: &DataKey, bind_hardware: bool) -> Result<Vec<u8>> {
        let mut header = MAGIC.to_vec();
        if bind_hardware {
            header.push(FLAG_HARDWARE_BOUND);
            header.extend_from_slice(&self.hardware_check());
        } else {
            header.push(0);
        }

        let key = self.file_key(master, bind_hardware)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| StoreError::InvalidFormat("bad key length".into()))?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: buffer,
                    aad: &header,
                },
            )
            .map_err(|_| StoreError::AuthenticationFailure)?;

        let mut out = header;
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        Ok(out)
    }

    /// Verify header, hardware binding and tag, then return the raw image.
    pub fn open(&self, bytes: &[u8], master: &DataKey) -> Result<Vec<u8>> {
        let header = FileHeader::parse(bytes)?;
        let (head, rest) = bytes.split_at(header.header_len);
        if header.hardware_bound {
            let stored = &head[MAGIC.len() + 1..];
            if stored != self.hardware_check().as_slice() {
                return Err(StoreError::HardwareMismatch);
            }
        }
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let key = self.file_key(master, header.hardware_bound)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| StoreError::InvalidFormat("bad key length".into()))?;
        cipher
            .decrypt(
                nonce.into(),
                Payload {
                    msg: ciphertext,
                    aad: head,
                },
            )
            .map_err(|_| StoreError::AuthenticationFailure)
    }

    /// Seal and write atomically: temp file in the same directory, fsync, rename.
    pub fn write(&self, buffer: &[u8], path: &Path, master: &DataKey, bind_hardware: bool) -> Result<()> {
        let sealed = self.seal(buffer, master, bind_hardware)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "database".to_string());
        let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

        let result = (|| -> std::io::Result<()> {
            let mut f = create_private(&tmp)?;
            f.write_all(&sealed)?;
            f.sync_all()?;
            std::fs::rename(&tmp, path)
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::debug!(path = %path.display(), bytes = sealed.len(), bound = bind_hardware, "encrypted database written");
        Ok(())
    }

    pub fn read(&self, path: &Path, master: &DataKey) -> Result<Vec<u8>> {
        let bytes = std::fs::read(path)?;
        self.open(&bytes, master)
    }

    /// Cheap marker check; never decrypts.
    pub fn is_encrypted_database_file(path: &Path) -> bool {
        let mut magic = [0u8; 8];
        match std::fs::File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
            Ok(()) => &magic == MAGIC,
            Err(_) => false,
        }
    }

    /// Header of an existing file without decrypting it.
    pub fn inspect(path: &Path) -> Result<FileHeader> {
        FileHeader::parse(&std::fs::read(path)?)
    }
}
