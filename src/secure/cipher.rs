//! AES-256-GCM sealing of secure records

use crate::error::{LogError, Result};
use crate::secure::{SecureRecord, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};

/// Seals and opens records under one device key
pub struct RecordCipher {
    cipher: Aes256Gcm,
}

impl RecordCipher {
    /// Create a cipher for `key`
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt `plaintext` under `nonce`, authenticating `timestamp`
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], timestamp: u32, plaintext: &[u8]) -> Result<SecureRecord> {
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), &timestamp.to_le_bytes(), &mut buffer)
            .map_err(|_| LogError::Crypto("encryption failed"))?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(SecureRecord {
            nonce: *nonce,
            timestamp,
            ciphertext: buffer,
            tag: tag_bytes,
        })
    }

    /// Verify and decrypt `record` using its embedded nonce and tag
    pub fn open(&self, record: &SecureRecord) -> Result<Vec<u8>> {
        let mut buffer = record.ciphertext.clone();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&record.nonce),
                &record.associated_data(),
                &mut buffer,
                Tag::from_slice(&record.tag),
            )
            .map_err(|_| LogError::Crypto("authentication tag mismatch"))?;
        Ok(buffer)
    }
}
