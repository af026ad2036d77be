//! Block backend error types

use std::sync::Arc;

use snapblock_ebs::EbsError;
use thiserror::Error;

/// Block backend error
///
/// `Clone` so that the outcome of one remote fetch can be handed to every
/// caller that joined it.
#[derive(Error, Debug, Clone)]
pub enum BlockError {
    /// Write-class operation on the read-only device
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The caller's context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The backend has been closed
    #[error("backend is closed")]
    Closed,

    /// A fatal metadata condition stopped the backend
    #[error("backend terminated: {0}")]
    Terminated(String),

    /// Offset out of bounds
    #[error("Offset {offset} + length {length} exceeds device size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// Remote block listing failed
    #[error("metadata fetch failed: {0}")]
    Metadata(#[source] Arc<EbsError>),

    /// Listing returned values that cannot describe a snapshot
    #[error("invalid snapshot metadata: {0}")]
    InvalidMetadata(String),

    /// Refreshed metadata disagrees with the installed snapshot
    #[error(
        "block size or volume size changed: old_block={old_block} new_block={new_block} \
         old_volume={old_volume} new_volume={new_volume}"
    )]
    MetadataChanged {
        old_block: u64,
        new_block: u64,
        old_volume: u64,
        new_volume: u64,
    },

    /// Remote fetch of a single block failed
    #[error("fetching block {block} failed: {source}")]
    Remote {
        block: u64,
        #[source]
        source: Arc<EbsError>,
    },

    /// Block data ended before the requested range
    #[error("block {block} has {len} bytes, need {needed}")]
    ShortBlock { block: u64, len: usize, needed: usize },

    /// Drained body length disagrees with the advertised length
    #[error("block {block} length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        block: u64,
        expected: u64,
        actual: u64,
    },

    /// Drained body does not match the advertised checksum
    #[error("block {block} checksum mismatch")]
    ChecksumMismatch { block: u64 },

    /// The task fetching a block went away without a result
    #[error("fetch of block {0} was abandoned")]
    FetchAbandoned(u64),
}

impl BlockError {
    pub(crate) fn remote(block: u64, source: EbsError) -> Self {
        Self::Remote {
            block,
            source: Arc::new(source),
        }
    }
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;

/// A read that stopped part-way
///
/// `completed` bytes at the start of the destination buffer are valid; the
/// operation as a whole still failed.
#[derive(Error, Debug, Clone)]
#[error("{error} (after {completed} bytes)")]
pub struct PartialIo {
    pub completed: usize,
    #[source]
    pub error: BlockError,
}

impl PartialIo {
    pub fn new(completed: usize, error: BlockError) -> Self {
        Self { completed, error }
    }
}

impl From<BlockError> for PartialIo {
    fn from(error: BlockError) -> Self {
        Self::new(0, error)
    }
}
