//! Ring log implementation over a flash region
//!
//! Frames are appended sequentially at `head` and consumed at `tail`. The
//! control block describing both cursors lives in the metadata store and is
//! rewritten after every mutation; the flash bytes themselves carry a magic
//! sentinel and a checksum per frame but no position information.
//!
//! Wrap policy: when a frame does not fit between `head` and the region end,
//! the region is erased through the configured [`WrapEraser`], both cursors
//! return to offset 0 and `cycle` is incremented. Any frames that were still
//! unread at that moment are lost; the loss is logged and counted in
//! [`RingStats::discarded_bytes`].
//!
//! Every operation takes the instance lock for its full duration, including
//! flash I/O and the control block write, so appends and reads are observed in
//! a single total order.

use crate::config::RingLogConfig;
use crate::error::{LogError, Result};
use crate::flash::erase::{WholeRegionEraser, WrapEraser};
use crate::flash::scan::FrameScanner;
use crate::flash::{ControlBlock, FrameHeader};
use crate::storage::{BlockStore, MetaStore, PartitionTable, ERASED_BYTE};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::Arc;

const TARGET: &str = "ringbuf_flash";

/// Snapshot of the ring log's position state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    /// Next write offset
    pub head: usize,
    /// Next read offset
    pub tail: usize,
    /// Wrap counter
    pub cycle: u32,
    /// Size of the flash region
    pub region_size: usize,
    /// Bytes written but not yet drained
    pub used_bytes: usize,
    /// Unread bytes dropped by wraps since this instance was opened
    pub discarded_bytes: u64,
}

struct RingState<B> {
    store: B,
    control: ControlBlock,
    discarded_bytes: u64,
}

/// Append-only log stored in a flash region
pub struct FlashRingLog<B: BlockStore, M: MetaStore> {
    config: RingLogConfig,
    meta: Arc<M>,
    eraser: Box<dyn WrapEraser>,
    state: Mutex<RingState<B>>,
}

impl<B: BlockStore, M: MetaStore> FlashRingLog<B, M> {
    /// Bind the region named in `config` and load its control block
    ///
    /// Fails with [`LogError::NotFound`] if the partition table has no such
    /// region.
    pub fn open<P>(partitions: &P, meta: Arc<M>, config: RingLogConfig) -> Result<Self>
    where
        P: PartitionTable<Region = B>,
    {
        let store = partitions
            .find_region(&config.label)?
            .ok_or_else(|| LogError::NotFound(format!("flash region '{}'", config.label)))?;

        debug!(target: TARGET, "partition find successful. label={}", config.label);
        Self::with_store(store, meta, config)
    }

    /// Use an already bound region
    ///
    /// A missing, wrong-version or corrupt control block is treated as first
    /// use: the whole region is erased and a fresh control block persisted.
    pub fn with_store(mut store: B, meta: Arc<M>, config: RingLogConfig) -> Result<Self> {
        let size = store.size();
        if size <= FrameHeader::SIZE || size > u32::MAX as usize {
            return Err(LogError::InvalidSize {
                size,
                capacity: u32::MAX as usize,
            });
        }

        let control = load_control(&mut store, meta.as_ref(), &config)?;

        Ok(Self {
            config,
            meta,
            eraser: Box::new(WholeRegionEraser),
            state: Mutex::new(RingState {
                store,
                control,
                discarded_bytes: 0,
            }),
        })
    }

    /// Replace the erase strategy used on wrap
    pub fn with_eraser(mut self, eraser: Box<dyn WrapEraser>) -> Self {
        self.eraser = eraser;
        self
    }

    /// Label of the bound region
    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Size of the bound region in bytes
    pub fn region_size(&self) -> usize {
        self.state.lock().store.size()
    }

    /// Largest payload a single frame can carry
    pub fn max_payload_len(&self) -> usize {
        self.region_size() - FrameHeader::SIZE
    }

    /// Get a copy of the control block
    pub fn control_block(&self) -> ControlBlock {
        self.state.lock().control
    }

    /// Current cursor positions and usage
    pub fn stats(&self) -> RingStats {
        let state = self.state.lock();
        let size = state.store.size();
        let head = state.control.head as usize;
        let tail = state.control.tail as usize;

        RingStats {
            head,
            tail,
            cycle: state.control.cycle,
            region_size: size,
            used_bytes: used_bytes(head, tail, size),
            discarded_bytes: state.discarded_bytes,
        }
    }

    /// Check whether everything written has been drained
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.control.head == state.control.tail
    }

    /// Append one frame carrying `data`
    ///
    /// If the frame does not fit before the region end, the log wraps first.
    /// A failed flash write leaves the persisted cursors where they were.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let size = state.store.size();

        let frame_len = FrameHeader::SIZE + data.len();
        if frame_len > size {
            return Err(LogError::InvalidSize {
                size: frame_len,
                capacity: size,
            });
        }

        let header = FrameHeader::for_payload(data);
        let mut control = state.control;

        if control.head as usize + frame_len > size {
            let unread = used_bytes(control.head as usize, control.tail as usize, size);
            if unread > 0 {
                warn!(
                    target: TARGET,
                    "wrapping with {} unread bytes; they will be erased. cycle={}",
                    unread, control.cycle
                );
                state.discarded_bytes += unread as u64;
            }

            debug!(target: TARGET, "wrapping around. erasing flash region '{}'", self.config.label);
            self.eraser.erase_for_wrap(&mut state.store)?;

            control.head = 0;
            control.tail = 0;
            control.cycle = control.cycle.wrapping_add(1);
            control.update_crc();

            // The erase already happened, so memory must follow it
            state.control = control;
            self.persist(&control)?;
        }

        let head = control.head as usize;

        if let Err(e) = state.store.write(head, &header.encode()) {
            error!(target: TARGET, "error while writing header at offset={}. err={}", head, e);
            return Err(e.into());
        }

        if let Err(e) = state.store.write(head + FrameHeader::SIZE, data) {
            error!(target: TARGET, "error while writing data at offset={}. err={}", head, e);
            return Err(e.into());
        }

        control.head = (head + frame_len) as u32;
        control.update_crc();
        state.control = control;

        debug!(
            target: TARGET,
            "wrote frame @ offset={} len={} crc=0x{:08X}",
            head, header.len, header.crc32
        );

        self.persist(&control)
    }

    /// Read and consume the frame at `tail`
    ///
    /// Returns `Ok(None)` when the log is empty. A missing sentinel yields
    /// [`LogError::NotFound`] and a payload checksum mismatch yields
    /// [`LogError::InvalidChecksum`]; in both cases `tail` does not move.
    pub fn read_next_record(&self) -> Result<Option<Vec<u8>>> {
        self.read_next_record_with(Ok)
    }

    /// Read the frame at `tail` and consume it only if `accept` succeeds
    ///
    /// `accept` runs under the instance lock with the checksum-verified
    /// payload. If it fails, its error is returned and `tail` stays on the
    /// frame, so the same frame is offered again by the next read.
    pub fn read_next_record_with<T, F>(&self, accept: F) -> Result<Option<T>>
    where
        F: FnOnce(Vec<u8>) -> Result<T>,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let size = state.store.size();
        let mut control = state.control;

        if control.head == control.tail {
            return Ok(None);
        }

        if control.tail as usize + FrameHeader::SIZE > size {
            control.tail = 0;
            if control.head == control.tail {
                return Ok(None);
            }
        }

        let tail = control.tail as usize;
        let mut raw = [0u8; FrameHeader::SIZE];
        state.store.read(tail, &mut raw)?;

        let header = FrameHeader::decode(&raw);
        if !header.is_valid() {
            error!(target: TARGET, "could not verify header at tail={}. magic=0x{:08X}", tail, header.magic);
            return Err(LogError::NotFound(format!("no valid frame at offset {tail}")));
        }

        let len = header.len as usize;
        if header.frame_len() > size {
            error!(target: TARGET, "frame at tail={} claims {} bytes", tail, len);
            return Err(LogError::InvalidSize {
                size: header.frame_len(),
                capacity: size,
            });
        }

        let mut payload = Vec::new();
        payload.try_reserve_exact(len)?;
        payload.resize(len, 0);

        let start = tail + FrameHeader::SIZE;
        if start + len > size {
            // Payload runs past the region end and continues at offset 0
            let first = size - start;
            state.store.read(start, &mut payload[..first])?;
            state.store.read(0, &mut payload[first..])?;
        } else {
            state.store.read(start, &mut payload)?;
        }

        if !header.verify_crc(&payload) {
            warn!(target: TARGET, "crc mismatch at tail={}", tail);
            return Err(LogError::InvalidChecksum { offset: tail });
        }

        let accepted = accept(payload)?;

        let next = start + len;
        let next = if next > size { next - size } else { next };
        control.tail = next as u32;
        control.update_crc();
        state.control = control;

        debug!(target: TARGET, "read frame @ offset={} len={}", tail, len);

        self.persist(&control)?;
        Ok(Some(accepted))
    }

    /// Payload of the newest frame on flash, drained or not
    ///
    /// Frames are walked from offset 0 to `head`. Fails with
    /// [`LogError::NotFound`] if that walk breaks before reaching `head`.
    pub fn last_record(&self) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        let head = state.control.head as usize;

        let mut scanner = FrameScanner::new(&state.store, head);
        let mut last = None;
        while let Some(frame) = scanner.next_frame()? {
            last = Some(frame.payload);
        }

        if scanner.position() != head {
            error!(target: TARGET, "frames end at offset={} but head={}", scanner.position(), head);
            return Err(LogError::NotFound(format!("no valid frame at offset {}", scanner.position())));
        }

        Ok(last)
    }

    /// Copy the payloads of all frames from offset 0 up to `head`
    ///
    /// Does not move `tail`. Stops at the first invalid frame or at the first
    /// frame that would push the output past `capacity` bytes.
    pub fn dump_all(&self, capacity: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let head = state.control.head as usize;

        let mut out = Vec::new();
        out.try_reserve_exact(capacity.min(head))?;

        let mut scanner = FrameScanner::new(&state.store, head);
        while let Some(header) = scanner.peek_header()? {
            if header.len as usize + out.len() > capacity {
                break;
            }
            match scanner.next_frame()? {
                Some(frame) => out.extend_from_slice(&frame.payload),
                None => break,
            }
        }

        Ok(out)
    }

    /// Erase the region and persist an empty control block
    ///
    /// This is the recovery path after any integrity failure; all stored
    /// frames are lost.
    pub fn reset_metadata(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        warn!(target: TARGET, "resetting ring log '{}'. erasing flash region", self.config.label);
        let control = reset_region(&mut state.store, self.meta.as_ref(), &self.config)?;
        state.control = control;
        Ok(())
    }

    fn persist(&self, control: &ControlBlock) -> Result<()> {
        save_control(self.meta.as_ref(), &self.config, control)
    }
}

fn used_bytes(head: usize, tail: usize, size: usize) -> usize {
    if head >= tail {
        head - tail
    } else {
        size - tail + head
    }
}

fn save_control<M: MetaStore + ?Sized>(meta: &M, config: &RingLogConfig, control: &ControlBlock) -> Result<()> {
    meta.set_blob(&config.meta_namespace, &config.label, &control.encode())?;
    meta.commit(&config.meta_namespace)?;
    Ok(())
}

fn reset_region<B: BlockStore, M: MetaStore + ?Sized>(
    store: &mut B,
    meta: &M,
    config: &RingLogConfig,
) -> Result<ControlBlock> {
    let size = store.size();
    store.erase_range(0, size)?;

    let control = ControlBlock::new();
    save_control(meta, config, &control)?;
    Ok(control)
}

fn load_control<B: BlockStore, M: MetaStore + ?Sized>(
    store: &mut B,
    meta: &M,
    config: &RingLogConfig,
) -> Result<ControlBlock> {
    let size = store.size();

    let reason = match meta.get_blob(&config.meta_namespace, &config.label)? {
        None => "no control block".to_string(),
        Some(bytes) => match ControlBlock::decode(&bytes) {
            Ok(control) if control.head as usize <= size && control.tail as usize <= size => {
                debug!(
                    target: TARGET,
                    "loaded control block. head={} tail={} cycle={}",
                    control.head, control.tail, control.cycle
                );
                return recover_head(store, meta, config, control);
            }
            Ok(control) => format!(
                "cursors out of range (head={} tail={} size={})",
                control.head, control.tail, size
            ),
            Err(e) if e.is_integrity_failure() => e.to_string(),
            Err(e) => return Err(e),
        },
    };

    debug!(
        target: TARGET,
        "treating '{}' as first use ({}). initializing control block and erasing region",
        config.label, reason
    );
    reset_region(store, meta, config)
}

/// Reconcile `head` with frames programmed after the last control block commit
///
/// Power loss between the flash write and the control block update leaves a
/// frame, or part of one, at `head`. Complete frames are adopted. Anything
/// else past the last good frame is erased so the next append can program it.
fn recover_head<B: BlockStore, M: MetaStore + ?Sized>(
    store: &mut B,
    meta: &M,
    config: &RingLogConfig,
    control: ControlBlock,
) -> Result<ControlBlock> {
    let size = store.size();
    let mut control = control;

    let mut scanner = FrameScanner::starting_at(&*store, control.head as usize, size);
    while let Some(frame) = scanner.next_frame()? {
        warn!(
            target: TARGET,
            "adopting uncommitted frame @ offset={} len={}",
            frame.offset,
            frame.payload.len()
        );
    }
    let end = scanner.position();

    let dirty = first_programmed(store, end)?;
    if let Some(offset) = dirty {
        warn!(
            target: TARGET,
            "erasing torn write in '{}' from offset={} (first programmed byte at {})",
            config.label, end, offset
        );
        store.erase_range(end, size - end)?;
    }

    if end != control.head as usize {
        control.head = end as u32;
        control.update_crc();
        save_control(meta, config, &control)?;
    }

    Ok(control)
}

/// Offset of the first non-erased byte at or after `from`
fn first_programmed<B: BlockStore>(store: &B, from: usize) -> Result<Option<usize>> {
    let size = store.size();
    let mut chunk = [0u8; 256];
    let mut offset = from;

    while offset < size {
        let len = chunk.len().min(size - offset);
        store.read(offset, &mut chunk[..len])?;
        if let Some(i) = chunk[..len].iter().position(|&b| b != ERASED_BYTE) {
            return Ok(Some(offset + i));
        }
        offset += len;
    }

    Ok(None)
}
