//! Flash-backed ring log
//!
//! This module provides the on-flash structures and the ring log built on them:
//!
//! - Control block tracking head, tail and wrap cycle, with CRC32 integrity
//! - Frame headers with a magic sentinel and a payload checksum
//! - The [`ring::FlashRingLog`] that appends and drains frames
//! - A non-destructive [`scan::FrameScanner`] for bulk export
//! - The [`erase::WrapEraser`] seam deciding what gets erased on wrap
//!
//! All multi-byte fields are stored little-endian and encoded explicitly, so
//! the persisted layout does not depend on struct layout or host endianness.

pub mod erase;
pub mod ring;
pub mod scan;

use crate::error::{LogError, Result};
use crc32fast::Hasher;

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

/// Ring log control block, persisted in the metadata store under the region label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    /// Next write offset
    pub head: u32,
    /// Next read offset
    pub tail: u32,
    /// Number of times the write cursor wrapped to offset 0
    pub cycle: u32,
    /// Format version of this block
    pub version: u32,
    /// CRC32 over the four preceding fields
    pub crc32: u32,
}

impl ControlBlock {
    /// Encoded size in bytes
    pub const SIZE: usize = 20;

    /// Current control block format version
    pub const VERSION: u32 = 1;

    /// Control block of an empty, freshly erased region
    pub fn new() -> Self {
        let mut block = Self {
            head: 0,
            tail: 0,
            cycle: 0,
            version: Self::VERSION,
            crc32: 0,
        };

        block.update_crc();
        block
    }

    fn fields(&self) -> [u8; Self::SIZE - 4] {
        let mut out = [0u8; Self::SIZE - 4];
        out[0..4].copy_from_slice(&self.head.to_le_bytes());
        out[4..8].copy_from_slice(&self.tail.to_le_bytes());
        out[8..12].copy_from_slice(&self.cycle.to_le_bytes());
        out[12..16].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    /// Recompute the CRC32 after a field changed
    pub fn update_crc(&mut self) {
        self.crc32 = crc32(&self.fields());
    }

    /// Verify the stored CRC32 against the fields
    pub fn verify_crc(&self) -> bool {
        self.crc32 == crc32(&self.fields())
    }

    /// Serialize for the metadata store
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..Self::SIZE - 4].copy_from_slice(&self.fields());
        out[Self::SIZE - 4..].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    /// Parse and validate a persisted control block
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(LogError::InvalidSize {
                size: bytes.len(),
                capacity: Self::SIZE,
            });
        }

        let block = Self {
            head: read_u32(bytes, 0),
            tail: read_u32(bytes, 4),
            cycle: read_u32(bytes, 8),
            version: read_u32(bytes, 12),
            crc32: read_u32(bytes, 16),
        };

        if block.version != Self::VERSION {
            return Err(LogError::InvalidVersion(block.version));
        }
        if !block.verify_crc() {
            return Err(LogError::InvalidChecksum { offset: 0 });
        }

        Ok(block)
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Header written in front of every payload on flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sentinel marking a valid frame
    pub magic: u32,
    /// Payload length in bytes
    pub len: u32,
    /// CRC32 of the payload
    pub crc32: u32,
}

impl FrameHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 12;

    /// Magic value of a valid frame
    pub const MAGIC: u32 = 0xABCD_1234;

    /// Build the header for `payload`
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            magic: Self::MAGIC,
            len: payload.len() as u32,
            crc32: crc32(payload),
        }
    }

    /// Serialize for flash
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.len.to_le_bytes());
        out[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    /// Parse raw header bytes. No validation happens here.
    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: read_u32(bytes, 0),
            len: read_u32(bytes, 4),
            crc32: read_u32(bytes, 8),
        }
    }

    /// Check if this header carries the frame sentinel
    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC
    }

    /// Verify the checksum of `payload` against the header
    pub fn verify_crc(&self, payload: &[u8]) -> bool {
        self.crc32 == crc32(payload)
    }

    /// Bytes occupied on flash by this frame
    pub fn frame_len(&self) -> usize {
        Self::SIZE + self.len as usize
    }
}
