//! Growable append-only event stream: a fixed array of lanes, each an
//! index-linked chain of fixed-size blocks.
//!
//! A stream is written by at most one writer per lane (enforced by an
//! atomic claim flag) and read only after all writers have finished.
//! Within those rules every lane touches only its own memory, so both
//! phases are lock-free; the per-stream block counter is the one piece
//! of shared metadata and it is a plain atomic.
//!
//! # Safety
//!
//! Lane state lives in `UnsafeCell`s and the `Send`/`Sync` impls are
//! written by hand. The conventions they rely on:
//!
//! 1. A lane is mutated only through a [`StreamWriter`] holding that
//!    lane's claim flag; `EventStream::writer` hands out at most one
//!    claim per lane at a time.
//! 2. Readers run only after the writers' completion has been observed
//!    through a scheduler edge (a task dependency), which is what makes
//!    the lane contents visible to the reading thread.
//! 3. No lane ever touches another lane's blocks.

mod block;
mod reader;
mod writer;

pub use block::{BlockIndex, BLOCK_PAYLOAD, BLOCK_SIZE, INVALID_BLOCK};
pub use reader::StreamReader;
pub use writer::StreamWriter;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use thiserror::Error;

use block::Block;

/// Lane access went wrong. These are producer wiring bugs, not runtime
/// conditions to recover from.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// Two writers asked for the same lane.
    #[error("lane {0} already has an active writer")]
    LaneClaimed(u32),
    /// Lane index past the stream's lane count.
    #[error("lane {0} out of range, stream has {1} lanes")]
    LaneOutOfRange(u32, u32),
}

/// One producer's private append state: its block arena plus the chain
/// cursor. `blocks` holds chain blocks and large-write segment blocks
/// interleaved; chain order is recovered through the `next` links.
pub(crate) struct Lane {
    pub blocks: Vec<Box<Block>>,
    pub first: BlockIndex,
    pub current: BlockIndex,
    pub offset: u32,
    pub elements: u32,
    pub bytes: u64,
}

impl Lane {
    const fn new() -> Self {
        Self {
            blocks: Vec::new(),
            first: INVALID_BLOCK,
            current: INVALID_BLOCK,
            offset: 0,
            elements: 0,
            bytes: 0,
        }
    }
}

/// Append-only stream for one event type, one frame.
///
/// Created with a fixed lane count (conventionally the worker count),
/// written in parallel across lanes, then handed to readers. Dropping
/// the stream frees every block; there is no separate dispose step.
pub struct EventStream {
    lanes: Box<[CachePadded<UnsafeCell<Lane>>]>,
    claims: Box<[AtomicBool]>,
    blocks_claimed: AtomicU64,
}

// SAFETY: lane contents are only mutated through a claimed StreamWriter
// (one per lane, see module docs) and only read after writer completion
// has propagated through a scheduler edge. Claim flags and the block
// counter are atomics. Under those conventions cross-thread access to
// disjoint lanes is race-free.
unsafe impl Send for EventStream {}
unsafe impl Sync for EventStream {}

impl EventStream {
    /// Creates a stream with `lane_count` empty lanes. Blocks are
    /// claimed lazily on first write, so an unused lane costs nothing.
    pub fn new(lane_count: usize) -> Self {
        assert!(lane_count >= 1, "stream needs at least one lane");
        let lanes = (0..lane_count)
            .map(|_| CachePadded::new(UnsafeCell::new(Lane::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let claims = (0..lane_count)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            lanes,
            claims,
            blocks_claimed: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn lane_count(&self) -> u32 {
        self.lanes.len() as u32
    }

    /// Blocks claimed across all lanes so far.
    #[inline]
    pub fn block_count(&self) -> u64 {
        self.blocks_claimed.load(Ordering::Relaxed)
    }

    /// Claims `lane` for writing. Fails if the lane is out of range or
    /// another writer already holds it; the claim is released when the
    /// returned writer drops.
    pub fn writer(self: &Arc<Self>, lane: u32) -> Result<StreamWriter, StreamError> {
        let count = self.lane_count();
        if lane >= count {
            return Err(StreamError::LaneOutOfRange(lane, count));
        }
        if self.claims[lane as usize]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(StreamError::LaneClaimed(lane));
        }
        Ok(StreamWriter::new(Arc::clone(self), lane))
    }

    /// Creates a read cursor. Call [`StreamReader::begin_lane`] before
    /// reading; reading while any lane is still claimed is a protocol
    /// violation caught in checked builds.
    pub fn reader(self: &Arc<Self>) -> StreamReader {
        StreamReader::new(Arc::clone(self))
    }

    /// Total records across all lanes. Only meaningful once no writers
    /// are active.
    pub fn item_count(&self) -> u64 {
        debug_assert!(
            !self.has_active_writers(),
            "item_count called while writers are active"
        );
        (0..self.lane_count())
            // SAFETY: no active writers (checked above in debug; by
            // protocol otherwise), so shared reads are race-free.
            .map(|i| unsafe { self.lane_ref(i) }.elements as u64)
            .sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    #[inline]
    pub(crate) fn has_active_writers(&self) -> bool {
        self.claims.iter().any(|c| c.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn lane_claimed(&self, lane: u32) -> bool {
        self.claims[lane as usize].load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn release_claim(&self, lane: u32) {
        self.claims[lane as usize].store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn note_blocks(&self, n: u64) {
        self.blocks_claimed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn lane_ptr(&self, lane: u32) -> *mut Lane {
        self.lanes[lane as usize].get()
    }

    /// # Safety
    ///
    /// The lane must not be concurrently mutated: either the caller
    /// holds the lane's claim, or no writer is active on it.
    #[inline]
    pub(crate) unsafe fn lane_ref(&self, lane: u32) -> &Lane {
        // SAFETY: forwarded to the caller.
        unsafe { &*self.lane_ptr(lane) }
    }
}

impl core::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventStream")
            .field("lanes", &self.lanes.len())
            .field("blocks_claimed", &self.block_count())
            .finish()
    }
}
