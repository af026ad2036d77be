//! Read-only block device backend over an EBS snapshot
//!
//! This crate turns the block listing and block fetch calls of the EBS
//! direct API into a byte-addressable, read-only device:
//! - Snapshot metadata (geometry and per-block access tokens), refreshed
//!   before the tokens expire
//! - Byte-range to block mapping for unaligned reads
//! - A bounded block cache with one remote fetch per block at a time
//! - The [`Backend`] contract consumed by an export server

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod layout;
pub mod metadata;
pub mod refresh;
pub mod singleflight;

#[cfg(test)]
mod mock;

pub use backend::{Backend, Geometry, SnapshotBackend};
pub use cache::{BlockCache, CacheStats};
pub use config::BackendConfig;
pub use error::{BlockError, BlockResult, PartialIo};
pub use layout::{BlockLayout, BlockRange};
pub use metadata::{SnapshotMetadata, fetch_metadata};

/// Bytes per GiB; the listing reports volume size in GiB
pub const GIB: u64 = 1 << 30;

/// Default number of blocks held in the block cache
pub const DEFAULT_CACHE_BLOCKS: u64 = 100;
