//! Storage contracts the log is built on
//!
//! The ring log never talks to hardware directly. It is written against three
//! small traits:
//!
//! - [`BlockStore`]: a fixed-size flash region with byte-offset reads, writes
//!   that only succeed on erased bytes, and range erase
//! - [`MetaStore`]: a crash-safe, namespaced key to blob store used for the
//!   control block and key material
//! - [`PartitionTable`]: lookup of a block store by region label
//!
//! Two families of implementations are provided. The memory backends emulate
//! NOR flash semantics and let tests poke at the raw bytes; the file backends
//! map a region file with `memmap2` and persist blobs with atomic renames.

pub mod file;
pub mod memory;

use std::io;

/// Value of an erased flash byte
pub const ERASED_BYTE: u8 = 0xFF;

/// A fixed-size, erase-before-write flash region
pub trait BlockStore: Send {
    /// Size of the region in bytes
    fn size(&self) -> usize;

    /// Fill `buf` with the bytes starting at `offset`
    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()>;

    /// Program `data` at `offset`. Fails if any target byte is not erased.
    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()>;

    /// Reset `len` bytes starting at `offset` to the erased state
    fn erase_range(&mut self, offset: usize, len: usize) -> io::Result<()>;
}

/// Namespaced blob persistence with single-operation durability
pub trait MetaStore: Send + Sync {
    /// Fetch a blob, `None` if it was never written or has been erased
    fn get_blob(&self, namespace: &str, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Store a blob, replacing any previous value
    fn set_blob(&self, namespace: &str, key: &str, value: &[u8]) -> io::Result<()>;

    /// Remove a blob. Removing a missing key is not an error.
    fn erase_key(&self, namespace: &str, key: &str) -> io::Result<()>;

    /// Make all writes in `namespace` durable
    fn commit(&self, namespace: &str) -> io::Result<()>;
}

/// Lookup of flash regions by label
pub trait PartitionTable {
    /// Block store type handed out for a region
    type Region: BlockStore;

    /// Bind the region named `label`, `None` if no such region exists
    fn find_region(&self, label: &str) -> io::Result<Option<Self::Region>>;
}

/// Reject accesses that fall outside a region of `size` bytes
pub(crate) fn check_bounds(size: usize, offset: usize, len: usize) -> io::Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("access of {len} bytes at offset {offset} exceeds region of {size} bytes"),
        )),
    }
}

/// Ensure every byte in `target` is erased before it is programmed
pub(crate) fn check_erased(target: &[u8], offset: usize) -> io::Result<()> {
    match target.iter().position(|&b| b != ERASED_BYTE) {
        None => Ok(()),
        Some(pos) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("write to non-erased flash at offset {}", offset + pos),
        )),
    }
}
