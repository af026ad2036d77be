//! Snapshot metadata: geometry, block tokens and their expiration
//!
//! A [`SnapshotMetadata`] value is built from one complete paginated block
//! listing and never modified afterwards. The backend publishes it through
//! an atomic reference cell and replaces it wholesale on refresh, so a
//! reader holding an `Arc<SnapshotMetadata>` always sees one consistent
//! listing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use snapblock_ebs::SnapshotApi;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::GIB;
use crate::error::{BlockError, BlockResult};

/// Immutable view of one snapshot listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Volume size in GiB
    pub volume_size: u64,
    /// Remote block size in bytes
    pub block_size: u64,
    /// Block index → access token, for every block present in the listing
    pub block_tokens: HashMap<u64, String>,
    /// Earliest expiry across all listing pages
    pub expiration: DateTime<Utc>,
}

impl SnapshotMetadata {
    /// Device size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.volume_size.saturating_mul(GIB)
    }

    /// Number of remote blocks covering the device
    pub fn block_count(&self) -> u64 {
        self.size_bytes().div_ceil(self.block_size)
    }

    /// Access token for a block, `None` if the listing omitted it
    pub fn token(&self, block_index: u64) -> Option<&str> {
        self.block_tokens.get(&block_index).map(String::as_str)
    }

    /// Check that `next` describes the same device as `self`
    pub fn ensure_same_geometry(&self, next: &Self) -> BlockResult<()> {
        if self.block_size != next.block_size || self.volume_size != next.volume_size {
            return Err(BlockError::MetadataChanged {
                old_block: self.block_size,
                new_block: next.block_size,
                old_volume: self.volume_size,
                new_volume: next.volume_size,
            });
        }
        Ok(())
    }
}

/// Build metadata from a complete listing of `snapshot_id`.
///
/// Follows `NextToken` until the last page. Any page failure discards what
/// was gathered so far. Cancelling `ctx` aborts with [`BlockError::Cancelled`].
pub async fn fetch_metadata(
    api: &dyn SnapshotApi,
    snapshot_id: &str,
    ctx: &CancellationToken,
) -> BlockResult<SnapshotMetadata> {
    info!("Fetching block metadata for {snapshot_id}");

    let mut geometry: Option<(u64, u64)> = None;
    let mut expiration: Option<DateTime<Utc>> = None;
    let mut block_tokens = HashMap::new();
    let mut next_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(BlockError::Cancelled),
            res = api.list_snapshot_blocks(snapshot_id, next_token.as_deref()) => {
                res.map_err(|e| BlockError::Metadata(Arc::new(e)))?
            }
        };
        pages += 1;

        match geometry {
            None => geometry = Some((page.volume_size, page.block_size)),
            Some((volume_size, block_size))
                if volume_size != page.volume_size || block_size != page.block_size =>
            {
                return Err(BlockError::InvalidMetadata(format!(
                    "page {pages} reports volume_size={} block_size={}, earlier pages \
                     reported volume_size={volume_size} block_size={block_size}",
                    page.volume_size, page.block_size
                )));
            }
            Some(_) => {}
        }

        expiration = Some(expiration.map_or(page.expiry_time, |e| e.min(page.expiry_time)));
        block_tokens.extend(page.blocks.into_iter().map(|b| (b.index, b.token)));

        match page.next_token {
            Some(token) => next_token = Some(token),
            None => break,
        }
    }

    let (Some((volume_size, block_size)), Some(expiration)) = (geometry, expiration) else {
        return Err(BlockError::InvalidMetadata("empty listing".into()));
    };
    if block_size == 0 {
        return Err(BlockError::InvalidMetadata("block size is zero".into()));
    }

    let metadata = SnapshotMetadata {
        volume_size,
        block_size,
        block_tokens,
        expiration,
    };
    debug!(
        "Listed {} pages, {} of {} blocks present",
        pages,
        metadata.block_tokens.len(),
        metadata.block_count()
    );
    info!(
        "Finished fetching block metadata: volume_size={}GiB block_size={} expiration={}",
        metadata.volume_size, metadata.block_size, metadata.expiration
    );
    Ok(metadata)
}
