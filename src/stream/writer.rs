//! Append cursor for one lane.

use std::sync::Arc;

use zerocopy::{Immutable, IntoBytes};

use super::block::{Block, LargeHeader, BLOCK_PAYLOAD, INVALID_BLOCK, LARGE_HEADER_SIZE};
use super::EventStream;

/// Exclusive append handle for one lane of an [`EventStream`].
///
/// Obtained from [`EventStream::writer`]; the lane claim is released
/// when the writer drops. Writes within a lane are sequential; a record
/// never straddles a block boundary, so each record must fit in one
/// block's payload (large payloads go through [`write_large`]).
///
/// [`write_large`]: StreamWriter::write_large
pub struct StreamWriter {
    stream: Arc<EventStream>,
    lane: u32,
}

impl StreamWriter {
    pub(crate) fn new(stream: Arc<EventStream>, lane: u32) -> Self {
        Self { stream, lane }
    }

    #[inline]
    pub fn lane(&self) -> u32 {
        self.lane
    }

    /// Appends one fixed-size record.
    #[inline]
    pub fn write<T: IntoBytes + Immutable>(&mut self, value: &T) {
        self.write_bytes(value.as_bytes());
    }

    /// Appends `bytes` as one record. Must fit in a single block.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.alloc(bytes.len()).copy_from_slice(bytes);
    }

    /// Appends one record of `n` bytes and returns the slot to fill.
    /// Starts a new chain block when the current block cannot hold it.
    pub fn alloc(&mut self, n: usize) -> &mut [u8] {
        debug_assert!(n > 0, "zero-size record");
        debug_assert!(
            n <= BLOCK_PAYLOAD,
            "record of {n} bytes exceeds the {BLOCK_PAYLOAD}-byte block payload; use write_large"
        );
        // SAFETY: this writer holds the lane claim, so it is the only
        // mutator of this lane.
        let lane = unsafe { &mut *self.stream.lane_ptr(self.lane) };
        if lane.current == INVALID_BLOCK || lane.offset as usize + n > BLOCK_PAYLOAD {
            let idx = lane.blocks.len() as u32;
            lane.blocks.push(Block::boxed());
            self.stream.note_blocks(1);
            if lane.first == INVALID_BLOCK {
                lane.first = idx;
            } else {
                lane.blocks[lane.current as usize].next = idx;
            }
            lane.current = idx;
            lane.offset = 0;
        }
        let start = lane.offset as usize;
        lane.offset += n as u32;
        lane.elements += 1;
        lane.bytes += n as u64;
        &mut lane.blocks[lane.current as usize].data[start..start + n]
    }

    /// Appends a payload of any size.
    ///
    /// A payload that fits in the current block's remaining capacity is
    /// stored inline after an 8-byte header; anything bigger goes into
    /// a contiguous run of fresh blocks outside the primary chain, so
    /// the chain itself never fragments. Read back with
    /// [`StreamReader::read_large`](super::StreamReader::read_large).
    pub fn write_large(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u32::MAX as usize, "payload too large");
        let remaining_after_header = {
            // SAFETY: lane claim held; shared reborrow released before
            // the nested writes below.
            let lane = unsafe { self.stream.lane_ref(self.lane) };
            if lane.current != INVALID_BLOCK
                && lane.offset as usize + LARGE_HEADER_SIZE <= BLOCK_PAYLOAD
            {
                BLOCK_PAYLOAD - lane.offset as usize - LARGE_HEADER_SIZE
            } else {
                BLOCK_PAYLOAD - LARGE_HEADER_SIZE
            }
        };

        if bytes.len() <= remaining_after_header {
            self.write(&LargeHeader {
                len: bytes.len() as u32,
                segment: INVALID_BLOCK,
            });
            if !bytes.is_empty() {
                self.write_bytes(bytes);
            }
            return;
        }

        let segment = {
            // SAFETY: lane claim held; exclusive reborrow, no nested
            // lane access while it lives.
            let lane = unsafe { &mut *self.stream.lane_ptr(self.lane) };
            let start = lane.blocks.len() as u32;
            lane.blocks.reserve(bytes.len().div_ceil(BLOCK_PAYLOAD));
            for chunk in bytes.chunks(BLOCK_PAYLOAD) {
                let mut block = Block::boxed();
                block.data[..chunk.len()].copy_from_slice(chunk);
                lane.blocks.push(block);
            }
            lane.bytes += bytes.len() as u64;
            start
        };
        self.stream
            .note_blocks(bytes.len().div_ceil(BLOCK_PAYLOAD) as u64);
        self.write(&LargeHeader {
            len: bytes.len() as u32,
            segment,
        });
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.stream.release_claim(self.lane);
    }
}

impl core::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("lane", &self.lane)
            .finish()
    }
}
