//! Read-only block device backend over one EBS snapshot
//!
//! ```text
//! read_at(offset, len)
//!   │
//!   ├── load metadata snapshot (one Arc for the whole call)
//!   ├── split [offset, offset+len) at block boundaries
//!   └── per block: cache → single-flight remote fetch → copy slice
//! ```
//!
//! The metadata is refreshed in the background before its block tokens
//! expire. A failed or inconsistent refresh terminates the backend; reads
//! then fail with [`BlockError::Terminated`].

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use snapblock_ebs::SnapshotApi;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{BlockCache, CacheStats};
use crate::config::BackendConfig;
use crate::error::{BlockError, BlockResult, PartialIo};
use crate::fetch::BlockFetcher;
use crate::layout::BlockLayout;
use crate::metadata::{SnapshotMetadata, fetch_metadata};
use crate::refresh::{FatalSender, Refresher};

/// Geometry advertised to block-device clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Device size in bytes
    pub size: u64,
    /// Minimum I/O size
    pub min_block: u64,
    /// Preferred I/O size
    pub preferred_block: u64,
    /// Maximum I/O size
    pub max_block: u64,
}

/// Block device operations consumed by an export server
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fill `buf` with device bytes starting at `offset`.
    ///
    /// On failure the error carries how many leading bytes of `buf` were
    /// filled before the failing block.
    async fn read_at(
        &self,
        ctx: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, PartialIo>;

    async fn write_at(
        &self,
        ctx: &CancellationToken,
        buf: &[u8],
        offset: u64,
        fua: bool,
    ) -> BlockResult<usize>;

    async fn trim_at(
        &self,
        ctx: &CancellationToken,
        length: u64,
        offset: u64,
    ) -> BlockResult<usize>;

    async fn flush(&self, ctx: &CancellationToken) -> BlockResult<()>;

    fn geometry(&self) -> BlockResult<Geometry>;

    /// Whether forced-unit-access writes are supported
    fn has_fua(&self) -> bool;

    /// Whether flush is supported
    fn has_flush(&self) -> bool;

    /// Stop background work and release resources. Idempotent.
    async fn close(&self, ctx: &CancellationToken) -> BlockResult<()>;
}

/// [`Backend`] serving the contents of one EBS snapshot
pub struct SnapshotBackend {
    snapshot_id: Arc<str>,
    metadata: Arc<ArcSwap<SnapshotMetadata>>,
    fetcher: BlockFetcher,
    /// Child of the construction context; cancelled by close or a fatal refresh
    shutdown: CancellationToken,
    fatal: FatalSender,
    refresher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotBackend {
    /// Fetch the initial metadata and start the background refresher.
    ///
    /// Cancelling `ctx` later shuts the backend down as [`Backend::close`]
    /// would, except that the refresher is not awaited.
    pub async fn new(
        ctx: &CancellationToken,
        api: Arc<dyn SnapshotApi>,
        snapshot_id: impl Into<Arc<str>>,
        config: BackendConfig,
    ) -> BlockResult<Self> {
        let snapshot_id: Arc<str> = snapshot_id.into();
        let initial = fetch_metadata(api.as_ref(), &snapshot_id, ctx).await?;
        info!(
            "Opened snapshot {snapshot_id}: volume_size={}GiB block_size={} blocks={} expiration={}",
            initial.volume_size,
            initial.block_size,
            initial.block_tokens.len(),
            initial.expiration
        );

        let shutdown = ctx.child_token();
        let cache = Arc::new(BlockCache::new(config.cache_capacity));
        let fetcher = BlockFetcher::new(
            Arc::clone(&api),
            Arc::clone(&snapshot_id),
            cache,
            initial.block_size,
            shutdown.clone(),
        );
        let metadata = Arc::new(ArcSwap::from_pointee(initial));
        let (fatal, _) = watch::channel(None);
        let fatal = Arc::new(fatal);

        let refresher = Refresher {
            api,
            snapshot_id: Arc::clone(&snapshot_id),
            metadata: Arc::clone(&metadata),
            margin: config.refresh_margin,
            shutdown: shutdown.clone(),
            fatal: Arc::clone(&fatal),
        }
        .spawn();

        Ok(Self {
            snapshot_id,
            metadata,
            fetcher,
            shutdown,
            fatal,
            refresher: parking_lot::Mutex::new(Some(refresher)),
        })
    }

    /// Snapshot this backend serves
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// Currently installed metadata
    pub fn metadata(&self) -> Arc<SnapshotMetadata> {
        self.metadata.load_full()
    }

    /// Block cache statistics
    pub fn cache_stats(&self) -> &CacheStats {
        self.fetcher.cache().stats()
    }

    /// Resolves with the fatal condition once the backend has terminated.
    ///
    /// Never resolves for a backend that is only closed.
    pub async fn terminated(&self) -> BlockError {
        let mut rx = self.fatal.subscribe();
        let fatal = rx.wait_for(Option::is_some).await.ok().and_then(|v| (*v).clone());
        match fatal {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    fn check_live(&self) -> BlockResult<()> {
        if let Some(err) = self.fatal.borrow().as_ref() {
            return Err(BlockError::Terminated(err.to_string()));
        }
        if self.shutdown.is_cancelled() {
            return Err(BlockError::Closed);
        }
        Ok(())
    }

    /// A fetch aborted by shutdown is reported with the reason for it
    fn shutdown_reason(&self, err: BlockError) -> BlockError {
        match err {
            BlockError::Closed => self.check_live().err().unwrap_or(BlockError::Closed),
            other => other,
        }
    }
}

#[async_trait]
impl Backend for SnapshotBackend {
    async fn read_at(
        &self,
        ctx: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, PartialIo> {
        self.check_live()?;

        let metadata = self.metadata.load_full();
        let length = buf.len() as u64;
        let size = metadata.size_bytes();
        if offset.checked_add(length).is_none_or(|end| end > size) {
            return Err(BlockError::OutOfBounds {
                offset,
                length,
                size,
            }
            .into());
        }

        let layout = BlockLayout::new(metadata.block_size);
        let mut filled = 0usize;
        for range in layout.byte_range_to_blocks(offset, length) {
            let data = self
                .fetcher
                .read_block(ctx, &metadata, range.block_index)
                .await
                .map_err(|e| PartialIo::new(filled, self.shutdown_reason(e)))?;

            // Ranges never exceed the block size, which fits in the buffer
            let skip = range.offset_in_block as usize;
            let len = range.length as usize;
            let Some(src) = data.get(skip..skip + len) else {
                warn!(
                    "short block: block={} len={} needed={}",
                    range.block_index,
                    data.len(),
                    skip + len
                );
                return Err(PartialIo::new(
                    filled,
                    BlockError::ShortBlock {
                        block: range.block_index,
                        len: data.len(),
                        needed: skip + len,
                    },
                ));
            };
            buf[filled..filled + len].copy_from_slice(src);
            filled += len;
        }

        Ok(filled)
    }

    async fn write_at(
        &self,
        _ctx: &CancellationToken,
        _buf: &[u8],
        _offset: u64,
        _fua: bool,
    ) -> BlockResult<usize> {
        Err(BlockError::NotSupported("write"))
    }

    async fn trim_at(
        &self,
        _ctx: &CancellationToken,
        _length: u64,
        _offset: u64,
    ) -> BlockResult<usize> {
        Err(BlockError::NotSupported("trim"))
    }

    async fn flush(&self, _ctx: &CancellationToken) -> BlockResult<()> {
        Err(BlockError::NotSupported("flush"))
    }

    fn geometry(&self) -> BlockResult<Geometry> {
        let metadata = self.metadata.load();
        Ok(Geometry {
            size: metadata.size_bytes(),
            min_block: metadata.block_size,
            preferred_block: metadata.block_size,
            max_block: metadata.block_size,
        })
    }

    fn has_fua(&self) -> bool {
        false
    }

    fn has_flush(&self) -> bool {
        false
    }

    async fn close(&self, _ctx: &CancellationToken) -> BlockResult<()> {
        self.shutdown.cancel();
        let handle = self.refresher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Metadata refresher for {} ended abnormally: {e}", self.snapshot_id);
            }
            info!("Closed snapshot backend for {}", self.snapshot_id);
        } else {
            debug!("Snapshot backend for {} already closed", self.snapshot_id);
        }
        Ok(())
    }
}

impl Drop for SnapshotBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
