//! Flashlog - a tamper-evident, crash-resilient append-only log for flash
//!
//! # Overview
//!
//! Flashlog stores an ordered sequence of variable-length records in a
//! dedicated flash region and hands them back, in order, when drained. It has
//! two layers:
//!
//! 1. A flash ring log that frames records with a sentinel and CRC32, wraps
//!    with an erase when the region is exhausted, and persists its head/tail
//!    control block to a metadata store after every mutation
//! 2. A secure log that seals each record with AES-256-GCM and chains every
//!    record's nonce to the previous record's tag, so deleting, reordering or
//!    editing any entry is detected on drain
//!
//! # Key Features
//!
//! - Survives power loss between any two writes; the control block is the
//!   single source of truth and is replaced atomically
//! - Deterministic corruption detection for both the control block and every
//!   frame, with reset-to-empty as the recovery path
//! - One lock per log instance; appends and drains are totally ordered
//! - Storage is abstracted behind [`BlockStore`], [`MetaStore`] and
//!   [`PartitionTable`], with in-memory and file-backed implementations
//!
//! # Usage
//!
//! 1. Provision a region and a metadata store
//! 2. Open a [`SecureLog`] (or a bare [`FlashRingLog`])
//! 3. Append entries from any thread
//! 4. Drain into a [`RecordSink`] such as [`HexLineSink`]
//!
//! See the `demos` directory for a runnable example.

#![deny(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod flash;
pub mod secure;
pub mod storage;

pub use config::{RingLogConfig, SecureLogConfig};
pub use error::{LogError, Result};
pub use flash::erase::{WholeRegionEraser, WrapEraser};
pub use flash::ring::{FlashRingLog, RingStats};
pub use flash::scan::{FrameScanner, ScannedFrame};
pub use secure::logger::SecureLog;
pub use secure::sink::{HexLineSink, RecordSink, VerifiedRecord};
pub use storage::file::{FileBlockStore, FileMetaStore, FilePartitionTable};
pub use storage::memory::{MemoryBlockStore, MemoryMetaStore, MemoryPartitionTable};
pub use storage::{BlockStore, MetaStore, PartitionTable};

/// Re-exported data types used in the API
pub mod types {
    pub use crate::flash::{ControlBlock, FrameHeader};
    pub use crate::secure::{KeyMaterial, SecureRecord};
    pub use crate::secure::cipher::RecordCipher;
}
