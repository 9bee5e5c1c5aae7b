//! Non-destructive frame scanner
//!
//! The scanner walks frames from offset 0 up to a caller-supplied end offset
//! (normally the ring's `head`) without touching the control block. It is
//! used for bulk export and for inspecting a region during recovery.
//!
//! Scanning stops for good at the first frame that is missing its sentinel,
//! claims a length that runs past the end offset, or fails its checksum.
//! Frames after a bad one are never trusted.

use crate::error::Result;
use crate::flash::FrameHeader;
use crate::storage::BlockStore;

/// A frame found by the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFrame {
    /// Region offset of the frame header
    pub offset: usize,
    /// Verified payload bytes
    pub payload: Vec<u8>,
}

/// Sequential reader over the frames of a region
pub struct FrameScanner<'a> {
    store: &'a dyn BlockStore,
    position: usize,
    end: usize,
    at_end: bool,
}

impl<'a> FrameScanner<'a> {
    /// Scan `store` from offset 0 up to `end`
    pub fn new(store: &'a dyn BlockStore, end: usize) -> Self {
        let end = end.min(store.size());
        Self {
            store,
            position: 0,
            end,
            at_end: end == 0,
        }
    }

    /// Scan `store` from `start` up to `end`
    ///
    /// `start` must be a frame boundary, e.g. a persisted `head`.
    pub fn starting_at(store: &'a dyn BlockStore, start: usize, end: usize) -> Self {
        let end = end.min(store.size());
        Self {
            store,
            position: start,
            end,
            at_end: start >= end,
        }
    }

    /// Offset of the next frame to be read
    pub fn position(&self) -> usize {
        self.position
    }

    /// Check if the scanner has stopped
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Header of the next frame, without consuming it
    ///
    /// Returns `None` and stops the scanner if no valid frame starts here.
    pub fn peek_header(&mut self) -> Result<Option<FrameHeader>> {
        if self.at_end {
            return Ok(None);
        }

        if self.position + FrameHeader::SIZE > self.end {
            self.at_end = true;
            return Ok(None);
        }

        let mut raw = [0u8; FrameHeader::SIZE];
        self.store.read(self.position, &mut raw)?;
        let header = FrameHeader::decode(&raw);

        if !header.is_valid() || self.position + header.frame_len() > self.end {
            self.at_end = true;
            return Ok(None);
        }

        Ok(Some(header))
    }

    /// Read and verify the next frame
    pub fn next_frame(&mut self) -> Result<Option<ScannedFrame>> {
        let header = match self.peek_header()? {
            Some(header) => header,
            None => return Ok(None),
        };

        let mut payload = Vec::new();
        payload.try_reserve_exact(header.len as usize)?;
        payload.resize(header.len as usize, 0);
        self.store.read(self.position + FrameHeader::SIZE, &mut payload)?;

        if !header.verify_crc(&payload) {
            log::warn!(target: "ringbuf_flash", "crc mismatch at pos={}", self.position);
            self.at_end = true;
            return Ok(None);
        }

        let offset = self.position;
        self.position += header.frame_len();
        self.at_end = self.position >= self.end;

        Ok(Some(ScannedFrame { offset, payload }))
    }

    /// Read up to `max_count` frames
    pub fn read_batch(&mut self, max_count: usize) -> Result<Vec<ScannedFrame>> {
        let mut frames = Vec::with_capacity(max_count.min(64));

        for _ in 0..max_count {
            match self.next_frame()? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }

        Ok(frames)
    }
}
