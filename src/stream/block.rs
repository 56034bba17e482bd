//! Fixed-size storage blocks and the index-linked chain layout.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Total footprint of one block, header included.
pub const BLOCK_SIZE: usize = 4096;

/// Bytes of record payload per block.
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - core::mem::size_of::<BlockIndex>();

/// Index of a block within its lane's arena.
pub type BlockIndex = u32;

/// Sentinel for "no block" / end of chain.
pub const INVALID_BLOCK: BlockIndex = u32::MAX;

/// One storage granule. Blocks belonging to a lane's primary chain are
/// linked through `next`; blocks backing a large-write segment sit
/// outside the chain and are addressed by index range instead.
#[repr(C)]
pub(crate) struct Block {
    pub next: BlockIndex,
    pub data: [u8; BLOCK_PAYLOAD],
}

const _: () = {
    assert!(core::mem::size_of::<Block>() == BLOCK_SIZE);
};

impl Block {
    #[inline]
    pub fn boxed() -> Box<Self> {
        Box::new(Self {
            next: INVALID_BLOCK,
            data: [0u8; BLOCK_PAYLOAD],
        })
    }
}

/// Header record written into the primary chain for every large write.
///
/// `segment == INVALID_BLOCK` means the payload was small enough to be
/// stored inline as an ordinary record immediately after this header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(crate) struct LargeHeader {
    pub len: u32,
    pub segment: BlockIndex,
}

pub(crate) const LARGE_HEADER_SIZE: usize = core::mem::size_of::<LargeHeader>();

const _: () = {
    assert!(LARGE_HEADER_SIZE == 8);
};
