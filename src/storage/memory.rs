//! In-memory storage backends
//!
//! These emulate NOR flash: a fresh region reads as `0xFF`, writes fail on
//! bytes that were not erased first, and erase restores `0xFF`. All handles
//! are cheap clones over shared state so a test can keep one handle while the
//! log owns another, then inspect or damage the bytes underneath it.

use crate::storage::{check_bounds, check_erased, BlockStore, MetaStore, PartitionTable, ERASED_BYTE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A flash region held in RAM
#[derive(Clone)]
pub struct MemoryBlockStore {
    bytes: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBlockStore {
    /// Create an erased region of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![ERASED_BYTE; size])),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Copy of the raw region contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Overwrite raw bytes, bypassing erase semantics
    pub fn overwrite(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Flip the bits of `mask` in the byte at `offset`
    pub fn flip_bits(&self, offset: usize, mask: u8) {
        self.bytes.lock()[offset] ^= mask;
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl BlockStore for MemoryBlockStore {
    fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let bytes = self.bytes.lock();
        check_bounds(bytes.len(), offset, buf.len())?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated flash write failure"));
        }

        let mut bytes = self.bytes.lock();
        check_bounds(bytes.len(), offset, data.len())?;
        let target = &mut bytes[offset..offset + data.len()];
        check_erased(target, offset)?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn erase_range(&mut self, offset: usize, len: usize) -> io::Result<()> {
        let mut bytes = self.bytes.lock();
        check_bounds(bytes.len(), offset, len)?;
        bytes[offset..offset + len].fill(ERASED_BYTE);
        Ok(())
    }
}

/// A namespaced blob store held in RAM
#[derive(Clone, Default)]
pub struct MemoryMetaStore {
    blobs: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
    commits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MemoryMetaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a stored blob in place, bypassing the log
    pub fn tamper(&self, namespace: &str, key: &str, f: impl FnOnce(&mut Vec<u8>)) {
        if let Some(blob) = self.blobs.lock().get_mut(&(namespace.to_string(), key.to_string())) {
            f(blob);
        }
    }

    /// Number of commits issued against `namespace`
    pub fn commit_count(&self, namespace: &str) -> usize {
        self.commits.lock().get(namespace).copied().unwrap_or(0)
    }
}

impl MetaStore for MemoryMetaStore {
    fn get_blob(&self, namespace: &str, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn set_blob(&self, namespace: &str, key: &str, value: &[u8]) -> io::Result<()> {
        self.blobs
            .lock()
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn erase_key(&self, namespace: &str, key: &str) -> io::Result<()> {
        self.blobs
            .lock()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn commit(&self, namespace: &str) -> io::Result<()> {
        *self.commits.lock().entry(namespace.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

/// A set of labelled in-memory regions
#[derive(Clone, Default)]
pub struct MemoryPartitionTable {
    regions: Arc<Mutex<HashMap<String, MemoryBlockStore>>>,
}

impl MemoryPartitionTable {
    /// Create a table with no regions
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an erased region and return a handle sharing its bytes
    pub fn add_region(&self, label: &str, size: usize) -> MemoryBlockStore {
        let region = MemoryBlockStore::new(size);
        self.regions.lock().insert(label.to_string(), region.clone());
        region
    }
}

impl PartitionTable for MemoryPartitionTable {
    type Region = MemoryBlockStore;

    fn find_region(&self, label: &str) -> io::Result<Option<MemoryBlockStore>> {
        Ok(self.regions.lock().get(label).cloned())
    }
}
