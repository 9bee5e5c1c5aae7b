//! File-backed storage backends
//!
//! A region is a plain file mapped into memory with `memmap2`; every mutation
//! is flushed before returning so a crashed process leaves the file exactly as
//! the last completed operation wrote it. Blobs live one-per-file under
//! `<dir>/<namespace>/<key>.blob` and are replaced with a write-then-rename,
//! which gives the single-operation atomicity the ring log depends on.

use crate::storage::{check_bounds, check_erased, BlockStore, MetaStore, PartitionTable, ERASED_BYTE};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A flash region backed by a memory-mapped file
pub struct FileBlockStore {
    path: PathBuf,
    mmap: MmapMut,
}

impl FileBlockStore {
    /// Create a new region file of `size` bytes in the erased state
    pub fn create<P: AsRef<Path>>(path: P, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "region size must be non-zero"));
        }

        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&vec![ERASED_BYTE; size])?;
        file.sync_all()?;

        Self::map(path, &file)
    }

    /// Open an existing region file
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        if file.metadata()?.len() == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "region file is empty"));
        }

        Self::map(path, &file)
    }

    fn map(path: PathBuf, file: &File) -> io::Result<Self> {
        // The file stays open for as long as the mapping exists
        let mmap = unsafe { MmapOptions::new().map_mut(file)? };
        Ok(Self { path, mmap })
    }

    /// Path of the region file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileBlockStore {
    fn size(&self) -> usize {
        self.mmap.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.mmap.len(), offset, buf.len())?;
        buf.copy_from_slice(&self.mmap[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        check_bounds(self.mmap.len(), offset, data.len())?;
        let target = &mut self.mmap[offset..offset + data.len()];
        check_erased(target, offset)?;
        target.copy_from_slice(data);
        self.mmap.flush_range(offset, data.len())
    }

    fn erase_range(&mut self, offset: usize, len: usize) -> io::Result<()> {
        check_bounds(self.mmap.len(), offset, len)?;
        self.mmap[offset..offset + len].fill(ERASED_BYTE);
        self.mmap.flush_range(offset, len)
    }
}

/// Regions stored as `<label>.bin` files inside a directory
pub struct FilePartitionTable {
    dir: PathBuf,
}

impl FilePartitionTable {
    /// Use `dir` as the partition directory, creating it if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    /// Create (or recreate) an erased region named `label`
    pub fn provision(&self, label: &str, size: usize) -> io::Result<FileBlockStore> {
        FileBlockStore::create(self.region_path(label), size)
    }

    fn region_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.bin"))
    }
}

impl PartitionTable for FilePartitionTable {
    type Region = FileBlockStore;

    fn find_region(&self, label: &str) -> io::Result<Option<FileBlockStore>> {
        let path = self.region_path(label);
        if !path.exists() {
            return Ok(None);
        }
        FileBlockStore::open(path).map(Some)
    }
}

/// Blob store persisted as one file per key
pub struct FileMetaStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileMetaStore {
    /// Use `dir` as the store root, creating it if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.dir.join(namespace)
    }

    fn blob_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace).join(format!("{key}.blob"))
    }
}

impl MetaStore for FileMetaStore {
    fn get_blob(&self, namespace: &str, key: &str) -> io::Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock();
        match fs::read(self.blob_path(namespace, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_blob(&self, namespace: &str, key: &str, value: &[u8]) -> io::Result<()> {
        let _guard = self.lock.lock();
        fs::create_dir_all(self.namespace_dir(namespace))?;

        let path = self.blob_path(namespace, key);
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
    }

    fn erase_key(&self, namespace: &str, key: &str) -> io::Result<()> {
        let _guard = self.lock.lock();
        match fs::remove_file(self.blob_path(namespace, key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn commit(&self, namespace: &str) -> io::Result<()> {
        let _guard = self.lock.lock();
        let dir = self.namespace_dir(namespace);
        if !dir.exists() {
            return Ok(());
        }
        // Persist the renames themselves
        File::open(dir)?.sync_all()
    }
}
