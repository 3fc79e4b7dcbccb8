//! Block geometry: maps payload byte offsets onto blocks and chunks.

use tide_config::LayoutConfig;

use crate::{BlockKey, PayloadId};

/// Block and chunk sizes for one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u64,
    pub chunk_size: u64,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self {
            block_size: tide_config::DEFAULT_BLOCK_SIZE,
            chunk_size: tide_config::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&LayoutConfig> for BlockLayout {
    fn from(cfg: &LayoutConfig) -> Self {
        Self {
            block_size: cfg.block_size,
            chunk_size: cfg.chunk_size,
        }
    }
}

/// The part of a byte range that falls into one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Payload-wide block index
    pub index: u64,
    /// Offset inside the block
    pub offset: u64,
    pub len: u64,
    /// Offset inside the caller's buffer
    pub buf_offset: u64,
}

impl BlockLayout {
    pub fn new(block_size: u64, chunk_size: u64) -> Self {
        Self {
            block_size,
            chunk_size,
        }
    }

    #[inline]
    pub fn blocks_per_chunk(&self) -> u64 {
        self.chunk_size / self.block_size
    }

    #[inline]
    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    #[inline]
    pub fn block_start(&self, index: u64) -> u64 {
        index * self.block_size
    }

    /// Number of blocks needed to hold `size` bytes.
    pub fn block_count(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size)
    }

    pub fn key(&self, payload: &PayloadId, index: u64) -> BlockKey {
        let per_chunk = self.blocks_per_chunk();
        BlockKey {
            payload: payload.clone(),
            chunk: index / per_chunk,
            block: index % per_chunk,
        }
    }

    pub fn index_of(&self, key: &BlockKey) -> u64 {
        key.chunk * self.blocks_per_chunk() + key.block
    }

    /// Split `[offset, offset + len)` into per-block spans in ascending order.
    pub fn spans(&self, offset: u64, len: u64) -> Vec<BlockSpan> {
        let mut out = Vec::new();
        let mut pos = offset;
        let end = offset.saturating_add(len);
        while pos < end {
            let index = self.block_of(pos);
            let in_block = pos - self.block_start(index);
            let take = (self.block_size - in_block).min(end - pos);
            out.push(BlockSpan {
                index,
                offset: in_block,
                len: take,
                buf_offset: pos - offset,
            });
            pos += take;
        }
        out
    }
}
