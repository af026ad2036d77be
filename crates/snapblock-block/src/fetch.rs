//! Block fetch coordinator
//!
//! Resolves a block index to its bytes: cache first, then a single remote
//! fetch per block index no matter how many readers ask for it at once.
//! Failed fetches are never cached; the next request retries.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use snapblock_ebs::{SnapshotApi, SnapshotBlock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::BlockCache;
use crate::error::{BlockError, BlockResult};
use crate::metadata::SnapshotMetadata;
use crate::singleflight::{FlightError, SingleFlight};

/// Deduplicating, caching reader of remote blocks
pub struct BlockFetcher {
    api: Arc<dyn SnapshotApi>,
    snapshot_id: Arc<str>,
    cache: Arc<BlockCache>,
    flights: SingleFlight<u64, BlockResult<Bytes>>,
    /// Served for blocks the listing omits
    zero_block: Bytes,
    /// Cancelled when the backend shuts down; aborts fetches in flight
    shutdown: CancellationToken,
}

impl BlockFetcher {
    pub fn new(
        api: Arc<dyn SnapshotApi>,
        snapshot_id: impl Into<Arc<str>>,
        cache: Arc<BlockCache>,
        block_size: u64,
        shutdown: CancellationToken,
    ) -> Self {
        let zero_len = usize::try_from(block_size).unwrap_or(usize::MAX);
        Self {
            api,
            snapshot_id: snapshot_id.into(),
            cache,
            flights: SingleFlight::new(),
            zero_block: Bytes::from(vec![0u8; zero_len]),
            shutdown,
        }
    }

    /// Get the block cache
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Number of blocks currently being fetched
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight_count()
    }

    /// Return the content of `block_index` as described by `metadata`.
    ///
    /// Concurrent calls for the same index share one remote fetch and its
    /// outcome. Cancelling `ctx` only stops this caller from waiting.
    pub async fn read_block(
        &self,
        ctx: &CancellationToken,
        metadata: &Arc<SnapshotMetadata>,
        block_index: u64,
    ) -> BlockResult<Bytes> {
        if ctx.is_cancelled() {
            return Err(BlockError::Cancelled);
        }
        if let Some(data) = self.cache.get(block_index).await {
            return Ok(data);
        }
        if metadata.token(block_index).is_none() {
            debug!("block {block_index} not in listing, serving zeros");
            return Ok(self.zero_block.clone());
        }

        let api = Arc::clone(&self.api);
        let cache = Arc::clone(&self.cache);
        let snapshot_id = Arc::clone(&self.snapshot_id);
        let metadata = Arc::clone(metadata);
        let shutdown = self.shutdown.clone();

        let flight = self.flights.execute(block_index, move || async move {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => Err(BlockError::Closed),
                res = fetch_block(api.as_ref(), &cache, &snapshot_id, &metadata, block_index) => res,
            }
        });

        tokio::select! {
            biased;
            () = ctx.cancelled() => Err(BlockError::Cancelled),
            res = flight => match res {
                Ok(outcome) => outcome,
                Err(FlightError::Abandoned) => Err(BlockError::FetchAbandoned(block_index)),
            },
        }
    }
}

/// Body of one fetch flight; runs once per cache-miss episode
async fn fetch_block(
    api: &dyn SnapshotApi,
    cache: &BlockCache,
    snapshot_id: &str,
    metadata: &SnapshotMetadata,
    block_index: u64,
) -> BlockResult<Bytes> {
    // Another flight may have filled the cache since the caller looked
    if let Some(data) = cache.peek(block_index).await {
        return Ok(data);
    }

    let token = metadata.token(block_index).ok_or_else(|| {
        BlockError::InvalidMetadata(format!("no token for block {block_index}"))
    })?;

    let block = api
        .get_snapshot_block(snapshot_id, block_index, token)
        .await
        .map_err(|e| {
            warn!("error fetching snapshot block: block={block_index} err={e}");
            BlockError::remote(block_index, e)
        })?;

    let data = drain_block(block_index, block).await.inspect_err(|e| {
        warn!("error reading snapshot block data: block={block_index} err={e}");
    })?;
    debug!("fetched block: block={block_index} len={}", data.len());

    cache.insert(block_index, data.clone()).await;
    Ok(data)
}

/// Read a block body to the end and verify length and checksum
async fn drain_block(block_index: u64, block: SnapshotBlock) -> BlockResult<Bytes> {
    let SnapshotBlock {
        data_length,
        checksum,
        checksum_algorithm,
        mut body,
    } = block;

    let capacity = data_length.and_then(|n| usize::try_from(n).ok()).unwrap_or(0);
    let mut buf = BytesMut::with_capacity(capacity);
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| BlockError::remote(block_index, e))?;
        buf.extend_from_slice(&chunk);
    }

    if let Some(expected) = data_length
        && expected != buf.len() as u64
    {
        return Err(BlockError::LengthMismatch {
            block: block_index,
            expected,
            actual: buf.len() as u64,
        });
    }

    if let Some(expected) = checksum {
        let algorithm = checksum_algorithm.as_deref().unwrap_or("SHA256");
        if algorithm.eq_ignore_ascii_case("SHA256") {
            if B64.encode(Sha256::digest(&buf)) != expected {
                return Err(BlockError::ChecksumMismatch { block: block_index });
            }
        } else {
            debug!("block {block_index}: unknown checksum algorithm {algorithm}, not verified");
        }
    }

    Ok(buf.freeze())
}
