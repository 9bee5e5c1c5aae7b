//! Authenticated, hash-chained log records
//!
//! Each secure record is sealed with AES-256-GCM under a per-device key. The
//! nonce of record `i + 1` is the (truncated) authentication tag of record
//! `i`, and the very first record after key creation uses a random seed. No
//! record stores a sequence number; the order is carried entirely by the
//! chain, so dropping, reordering or editing a record breaks verification of
//! everything that follows it.
//!
//! Wire format of a record (the payload of one flash frame):
//!
//! ```text
//! [nonce (12)][timestamp u32 LE (4)][ciphertext (n)][tag (16)]
//! ```
//!
//! The timestamp is authenticated as associated data but stored in the clear.

pub mod cipher;
pub mod logger;
pub mod sink;

use crate::error::{LogError, Result};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes
pub const KEY_SIZE: usize = 32;
/// Size of the chained nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;
/// Size of the associated-data timestamp in bytes
pub const TIMESTAMP_SIZE: usize = 4;
/// Bytes a secure record adds around its ciphertext
pub const RECORD_OVERHEAD: usize = NONCE_SIZE + TIMESTAMP_SIZE + TAG_SIZE;

/// Nonce that follows a record carrying `tag`
pub fn chain_nonce(tag: &[u8; TAG_SIZE]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&tag[..NONCE_SIZE]);
    nonce
}

/// Per-device key and both ends of the record chain
///
/// `chain` is where the writer continues, `verified` is where the reader
/// continues. Both are persisted so a reboot resumes the chain on either side.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Symmetric key
    pub key: [u8; KEY_SIZE],
    /// Tag prefix of the last record written, or the random seed
    pub chain: [u8; NONCE_SIZE],
    /// Nonce the next drained record must carry
    pub verified: [u8; NONCE_SIZE],
}

impl KeyMaterial {
    /// Encoded size in bytes
    pub const SIZE: usize = KEY_SIZE + 2 * NONCE_SIZE;

    /// Fresh material: nothing written, so the reader waits at the seed
    pub fn new(key: [u8; KEY_SIZE], seed: [u8; NONCE_SIZE]) -> Self {
        Self {
            key,
            chain: seed,
            verified: seed,
        }
    }

    /// Serialize for the metadata store
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..KEY_SIZE].copy_from_slice(&self.key);
        out[KEY_SIZE..KEY_SIZE + NONCE_SIZE].copy_from_slice(&self.chain);
        out[KEY_SIZE + NONCE_SIZE..].copy_from_slice(&self.verified);
        out
    }

    /// Parse a persisted blob
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(LogError::InvalidSize {
                size: bytes.len(),
                capacity: Self::SIZE,
            });
        }

        let mut material = Self::new([0u8; KEY_SIZE], [0u8; NONCE_SIZE]);
        material.key.copy_from_slice(&bytes[..KEY_SIZE]);
        material.chain.copy_from_slice(&bytes[KEY_SIZE..KEY_SIZE + NONCE_SIZE]);
        material.verified.copy_from_slice(&bytes[KEY_SIZE + NONCE_SIZE..]);
        Ok(material)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("chain", &hex::encode(self.chain))
            .field("verified", &hex::encode(self.verified))
            .finish()
    }
}

/// A sealed record as stored in one flash frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureRecord {
    /// Nonce the record was sealed with
    pub nonce: [u8; NONCE_SIZE],
    /// Milliseconds since boot when the entry was written
    pub timestamp: u32,
    /// Encrypted entry, same length as the plaintext
    pub ciphertext: Vec<u8>,
    /// Authentication tag over ciphertext and timestamp
    pub tag: [u8; TAG_SIZE],
}

impl SecureRecord {
    /// Associated data authenticated with the ciphertext
    pub fn associated_data(&self) -> [u8; TIMESTAMP_SIZE] {
        self.timestamp.to_le_bytes()
    }

    /// Nonce for the record that follows this one
    pub fn next_nonce(&self) -> [u8; NONCE_SIZE] {
        chain_nonce(&self.tag)
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.ciphertext.len()
    }

    /// Serialize into the flash payload layout
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.associated_data());
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse a flash payload
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_OVERHEAD {
            return Err(LogError::InvalidSize {
                size: bytes.len(),
                capacity: RECORD_OVERHEAD,
            });
        }

        let (nonce_bytes, rest) = bytes.split_at(NONCE_SIZE);
        let (ts_bytes, rest) = rest.split_at(TIMESTAMP_SIZE);
        let (ciphertext, tag_bytes) = rest.split_at(rest.len() - TAG_SIZE);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        let mut ts = [0u8; TIMESTAMP_SIZE];
        ts.copy_from_slice(ts_bytes);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(tag_bytes);

        Ok(Self {
            nonce,
            timestamp: u32::from_le_bytes(ts),
            ciphertext: ciphertext.to_vec(),
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = SecureRecord {
            nonce: [1u8; NONCE_SIZE],
            timestamp: 0x0403_0201,
            ciphertext: b"cipher".to_vec(),
            tag: [9u8; TAG_SIZE],
        };

        let bytes = record.encode();
        assert_eq!(bytes.len(), RECORD_OVERHEAD + 6);
        assert_eq!(&bytes[..NONCE_SIZE], &[1u8; NONCE_SIZE]);
        assert_eq!(&bytes[NONCE_SIZE..NONCE_SIZE + 4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[16..22], b"cipher");
        assert_eq!(SecureRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_record_too_short() {
        let result = SecureRecord::decode(&[0u8; RECORD_OVERHEAD - 1]);
        assert!(matches!(result, Err(LogError::InvalidSize { .. })));

        // An empty ciphertext is still a well-formed record
        let record = SecureRecord::decode(&[0u8; RECORD_OVERHEAD]).unwrap();
        assert!(record.ciphertext.is_empty());
    }

    #[test]
    fn test_chain_nonce_is_tag_prefix() {
        let mut tag = [0u8; TAG_SIZE];
        for (i, b) in tag.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(chain_nonce(&tag), [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_key_material_blob() {
        let mut material = KeyMaterial::new([0x42; KEY_SIZE], [0x17; NONCE_SIZE]);
        assert_eq!(material.verified, material.chain);
        material.verified = [0x33; NONCE_SIZE];

        let decoded = KeyMaterial::decode(&material.encode()).unwrap();
        assert_eq!(decoded.key, material.key);
        assert_eq!(decoded.chain, material.chain);
        assert_eq!(decoded.verified, [0x33; NONCE_SIZE]);

        assert!(KeyMaterial::decode(&[0u8; 12]).is_err());
        assert!(KeyMaterial::decode(&[0u8; KEY_SIZE + NONCE_SIZE]).is_err());
        assert!(!format!("{:?}", material).contains("42424242"));
    }
}
