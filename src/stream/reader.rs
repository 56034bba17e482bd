//! Sequential read cursor over a lane's block chain.

use std::sync::Arc;

use zerocopy::FromBytes;

use super::block::{LargeHeader, BLOCK_PAYLOAD, INVALID_BLOCK};
use super::{BlockIndex, EventStream};

/// Read cursor over an [`EventStream`], one lane at a time.
///
/// Reads must mirror the writes: the same sequence of record sizes, in
/// order. The cursor applies the writer's block-placement rule (a
/// record that would not have fit moves to the next chain block), so
/// the two stay in lockstep without any per-record framing. Checked
/// builds verify at [`end_lane`] that every written byte was consumed.
///
/// [`end_lane`]: StreamReader::end_lane
pub struct StreamReader {
    stream: Arc<EventStream>,
    lane: u32,
    block: BlockIndex,
    offset: u32,
    remaining: u32,
    bytes_read: u64,
    expected_bytes: u64,
    scratch: Vec<u8>,
}

impl StreamReader {
    pub(crate) fn new(stream: Arc<EventStream>) -> Self {
        Self {
            stream,
            lane: 0,
            block: INVALID_BLOCK,
            offset: 0,
            remaining: 0,
            bytes_read: 0,
            expected_bytes: 0,
            scratch: Vec::new(),
        }
    }

    #[inline]
    pub fn lane_count(&self) -> u32 {
        self.stream.lane_count()
    }

    /// Records left to read in the current lane.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Positions the cursor at the start of `lane` and returns the
    /// lane's record count.
    pub fn begin_lane(&mut self, lane: u32) -> u32 {
        let count = self.stream.lane_count();
        assert!(lane < count, "lane {lane} out of range, stream has {count} lanes");
        debug_assert!(
            !self.stream.lane_claimed(lane),
            "lane {lane} still has an active writer"
        );
        // SAFETY: no writer is active on this lane (checked above in
        // debug; guaranteed by the container protocol otherwise).
        let state = unsafe { self.stream.lane_ref(lane) };
        self.lane = lane;
        self.block = state.first;
        self.offset = 0;
        self.remaining = state.elements;
        self.bytes_read = 0;
        self.expected_bytes = state.bytes;
        state.elements
    }

    /// Reads the next fixed-size record.
    #[inline]
    pub fn read<T: FromBytes>(&mut self) -> T {
        let bytes = self.take(core::mem::size_of::<T>());
        T::read_from_bytes(bytes).expect("take yields exactly size_of::<T>() bytes")
    }

    /// Reads the next record as `n` raw bytes.
    #[inline]
    pub fn read_bytes(&mut self, n: usize) -> &[u8] {
        self.take(n)
    }

    /// Reads a payload written with
    /// [`StreamWriter::write_large`](super::StreamWriter::write_large).
    ///
    /// The returned slice borrows block memory directly when the
    /// payload sits in a single block; a payload spanning several
    /// segment blocks is copied into the reader's scratch buffer first,
    /// since separately allocated blocks are never adjacent in memory.
    pub fn read_large(&mut self) -> &[u8] {
        let header: LargeHeader = self.read();
        let len = header.len as usize;
        if len == 0 {
            return &[];
        }
        if header.segment == INVALID_BLOCK {
            return self.take(len);
        }
        // SAFETY: same no-active-writer condition as begin_lane.
        let state = unsafe { self.stream.lane_ref(self.lane) };
        self.bytes_read += len as u64;
        let start = header.segment as usize;
        if len <= BLOCK_PAYLOAD {
            return &state.blocks[start].data[..len];
        }
        self.scratch.clear();
        self.scratch.reserve(len);
        let mut copied = 0;
        let mut index = start;
        while copied < len {
            let take = (len - copied).min(BLOCK_PAYLOAD);
            self.scratch.extend_from_slice(&state.blocks[index].data[..take]);
            copied += take;
            index += 1;
        }
        &self.scratch
    }

    /// Ends the current lane. In checked builds, verifies the lane was
    /// consumed exactly: every record read, every byte accounted for.
    pub fn end_lane(&mut self) {
        debug_assert_eq!(
            self.remaining, 0,
            "lane {} ended with {} unread records",
            self.lane, self.remaining
        );
        debug_assert_eq!(
            self.bytes_read, self.expected_bytes,
            "lane {} read {} of {} written bytes",
            self.lane, self.bytes_read, self.expected_bytes
        );
        self.block = INVALID_BLOCK;
        self.remaining = 0;
    }

    fn take(&mut self, n: usize) -> &[u8] {
        debug_assert!(n > 0 && n <= BLOCK_PAYLOAD, "record of {n} bytes");
        debug_assert!(self.remaining > 0, "read past the written record count");
        // SAFETY: same no-active-writer condition as begin_lane.
        let state = unsafe { self.stream.lane_ref(self.lane) };
        // Mirror the writer: a record that would not have fit here was
        // placed at the start of the next chain block.
        if self.offset as usize + n > BLOCK_PAYLOAD {
            self.block = state.blocks[self.block as usize].next;
            self.offset = 0;
        }
        let start = self.offset as usize;
        self.offset += n as u32;
        self.remaining = self.remaining.saturating_sub(1);
        self.bytes_read += n as u64;
        &state.blocks[self.block as usize].data[start..start + n]
    }
}

impl core::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamReader")
            .field("lane", &self.lane)
            .field("remaining", &self.remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BLOCK_PAYLOAD;
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
    #[repr(C)]
    struct Sample {
        id: u64,
        value: u64,
    }

    #[test]
    fn test_roundtrip_fixed_records() {
        let stream = Arc::new(EventStream::new(1));
        let mut writer = stream.writer(0).unwrap();
        for i in 0..2000u64 {
            writer.write(&Sample { id: i, value: i * 3 });
        }
        drop(writer);

        let mut reader = stream.reader();
        let count = reader.begin_lane(0);
        assert_eq!(count, 2000);
        for i in 0..count as u64 {
            let sample: Sample = reader.read();
            assert_eq!(sample.id, i);
            assert_eq!(sample.value, i * 3);
        }
        reader.end_lane();
    }

    #[test]
    fn test_roundtrip_across_block_boundary() {
        let stream = Arc::new(EventStream::new(1));
        let mut writer = stream.writer(0).unwrap();
        // Two records that cannot share a block.
        writer.write_bytes(&[0x11u8; BLOCK_PAYLOAD - 3]);
        writer.write_bytes(&[0x22u8; 64]);
        drop(writer);

        let mut reader = stream.reader();
        assert_eq!(reader.begin_lane(0), 2);
        assert!(reader.read_bytes(BLOCK_PAYLOAD - 3).iter().all(|&b| b == 0x11));
        assert!(reader.read_bytes(64).iter().all(|&b| b == 0x22));
        reader.end_lane();
    }

    #[test]
    fn test_roundtrip_mixed_records_and_large_payloads() {
        let stream = Arc::new(EventStream::new(1));
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 255) as u8).collect();

        let mut writer = stream.writer(0).unwrap();
        writer.write(&7u64);
        writer.write_large(&payload);
        writer.write(&9u64);
        drop(writer);

        let mut reader = stream.reader();
        assert_eq!(reader.begin_lane(0), 4);
        assert_eq!(reader.read::<u64>(), 7);
        assert_eq!(reader.read_large(), payload.as_slice());
        assert_eq!(reader.read::<u64>(), 9);
        reader.end_lane();
    }

    #[test]
    fn test_lanes_read_independently() {
        let stream = Arc::new(EventStream::new(3));
        for lane in 0..3u32 {
            let mut writer = stream.writer(lane).unwrap();
            for i in 0..(lane + 1) * 10 {
                writer.write(&(lane * 1000 + i));
            }
        }

        let mut reader = stream.reader();
        for lane in [2u32, 0, 1] {
            let count = reader.begin_lane(lane);
            assert_eq!(count, (lane + 1) * 10);
            for i in 0..count {
                assert_eq!(reader.read::<u32>(), lane * 1000 + i);
            }
            reader.end_lane();
        }
        assert_eq!(stream.item_count(), 60);
    }

    #[test]
    fn test_empty_lane_reads_as_zero_records() {
        let stream = Arc::new(EventStream::new(2));
        let mut reader = stream.reader();
        assert_eq!(reader.begin_lane(1), 0);
        reader.end_lane();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "read past the written record count")]
    fn test_overread_is_a_contract_violation() {
        let stream = Arc::new(EventStream::new(1));
        let mut writer = stream.writer(0).unwrap();
        writer.write(&1u32);
        drop(writer);

        let mut reader = stream.reader();
        reader.begin_lane(0);
        let _: u32 = reader.read();
        let _: u32 = reader.read();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unread records")]
    fn test_underread_fails_verification() {
        let stream = Arc::new(EventStream::new(1));
        let mut writer = stream.writer(0).unwrap();
        writer.write(&1u32);
        writer.write(&2u32);
        drop(writer);

        let mut reader = stream.reader();
        reader.begin_lane(0);
        let _: u32 = reader.read();
        reader.end_lane();
    }
}
