//! Erase strategy applied when the write cursor wraps

use crate::storage::BlockStore;
use std::io;

/// Decides which part of the region is erased before writing resumes at offset 0
pub trait WrapEraser: Send + Sync {
    /// Prepare `store` for writes starting at offset 0 again
    ///
    /// Bytes past the new write position must read as erased afterwards;
    /// recovery after power loss treats any frame found there as unfinished.
    fn erase_for_wrap(&self, store: &mut dyn BlockStore) -> io::Result<()>;
}

/// Erase the whole region on every wrap
///
/// Every byte written in the previous cycle is lost, read or not. This costs
/// a full-region erase per cycle but keeps the write path trivially correct.
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeRegionEraser;

impl WrapEraser for WholeRegionEraser {
    fn erase_for_wrap(&self, store: &mut dyn BlockStore) -> io::Result<()> {
        let size = store.size();
        store.erase_range(0, size)
    }
}
