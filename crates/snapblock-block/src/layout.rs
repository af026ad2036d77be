//! Mapping of device byte ranges onto remote blocks
//!
//! ```text
//! Device (8GiB, 512KiB blocks)
//! ├── Block 0:  bytes 0 - 512KiB
//! ├── Block 1:  bytes 512KiB - 1MiB
//! │   ...
//! └── Block N:  bytes N*512KiB - (N+1)*512KiB
//! ```

/// A range of bytes within one remote block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// Remote block index
    pub block_index: u64,
    /// Byte offset within the block (the "skip")
    pub offset_in_block: u64,
    /// Number of bytes in this range
    pub length: u64,
}

/// Splits byte ranges at remote block boundaries
#[derive(Debug, Clone, Copy)]
pub struct BlockLayout {
    block_size: u64,
}

impl BlockLayout {
    /// Create a layout for the given block size (must be non-zero)
    pub fn new(block_size: u64) -> Self {
        assert!(block_size > 0, "Block size must be positive");
        Self { block_size }
    }

    /// Get the block size
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Convert a byte offset to a block index
    pub fn block_index(&self, byte_offset: u64) -> u64 {
        byte_offset / self.block_size
    }

    /// Convert a byte range to block ranges, in increasing offset order.
    ///
    /// The first and last ranges are clipped to the requested bytes; no
    /// alignment is required.
    pub fn byte_range_to_blocks(&self, start_byte: u64, length: u64) -> Vec<BlockRange> {
        if length == 0 {
            return Vec::new();
        }

        let end_byte = start_byte + length;
        let first = self.block_index(start_byte);
        let last = self.block_index(end_byte - 1);

        (first..=last)
            .map(|block_index| {
                let block_start = block_index * self.block_size;
                let block_end = block_start + self.block_size;

                // Intersection of [start_byte, end_byte) and [block_start, block_end)
                let range_start = start_byte.max(block_start);
                let range_end = end_byte.min(block_end);

                BlockRange {
                    block_index,
                    offset_in_block: range_start - block_start,
                    length: range_end - range_start,
                }
            })
            .collect()
    }
}
