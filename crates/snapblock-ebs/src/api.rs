//! The remote snapshot storage API consumed by the block backend

use async_trait::async_trait;

use crate::error::EbsResult;
use crate::types::{BlockListPage, SnapshotBlock};

/// Read-only access to an EBS snapshot
///
/// Implemented by [`crate::EbsClient`] for the real service. Tests provide
/// in-memory implementations.
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// Fetch one page of the block listing.
    ///
    /// `next_token` is `None` for the first page and the previous page's
    /// `next_token` afterwards.
    async fn list_snapshot_blocks(
        &self,
        snapshot_id: &str,
        next_token: Option<&str>,
    ) -> EbsResult<BlockListPage>;

    /// Open the content of a single block.
    async fn get_snapshot_block(
        &self,
        snapshot_id: &str,
        block_index: u64,
        block_token: &str,
    ) -> EbsResult<SnapshotBlock>;
}
