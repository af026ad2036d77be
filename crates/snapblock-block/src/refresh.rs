//! Background refresh of snapshot metadata
//!
//! Block tokens stop working at the listing's expiration, so a fresh listing
//! is fetched `refresh_margin` before that instant and swapped in as a whole.
//! A refresh that fails, or that reports a different volume or block size,
//! is fatal: the backend is stopped rather than left serving reads against
//! expired or inconsistent metadata.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use snapblock_ebs::SnapshotApi;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BlockError, BlockResult};
use crate::metadata::{SnapshotMetadata, fetch_metadata};

/// Lower bound on the wait between two consecutive refreshes
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Time to sleep before refreshing metadata that expires at `expiration`.
///
/// Zero when the refresh is already due.
pub fn refresh_wait(expiration: DateTime<Utc>, margin: Duration, now: DateTime<Utc>) -> Duration {
    let Ok(margin) = chrono::Duration::from_std(margin) else {
        return Duration::ZERO;
    };
    expiration
        .checked_sub_signed(margin)
        .and_then(|deadline| (deadline - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Sender side of the backend's fatal-condition channel
pub(crate) type FatalSender = Arc<watch::Sender<Option<BlockError>>>;

/// The single refresh task of one backend
pub(crate) struct Refresher {
    pub api: Arc<dyn SnapshotApi>,
    pub snapshot_id: Arc<str>,
    pub metadata: Arc<ArcSwap<SnapshotMetadata>>,
    pub margin: Duration,
    pub shutdown: CancellationToken,
    pub fatal: FatalSender,
}

impl Refresher {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut refreshed = false;
        loop {
            let expiration = self.metadata.load().expiration;
            let mut wait = refresh_wait(expiration, self.margin, Utc::now());
            if refreshed && wait < MIN_REFRESH_INTERVAL {
                warn!("Refreshed metadata expires at {expiration}, inside the refresh margin");
                wait = MIN_REFRESH_INTERVAL;
            }
            debug!("Next metadata refresh for {} in {wait:?}", self.snapshot_id);

            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }

            match self.refresh_once().await {
                Ok(()) => refreshed = true,
                // Shut down while the listing was in progress
                Err(BlockError::Cancelled) => break,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
        debug!("Metadata refresher for {} stopped", self.snapshot_id);
    }

    async fn refresh_once(&self) -> BlockResult<()> {
        let next = fetch_metadata(self.api.as_ref(), &self.snapshot_id, &self.shutdown).await?;

        // Verify that the geometry hasn't changed (which would be weird)
        self.metadata.load().ensure_same_geometry(&next)?;

        let expiration = next.expiration;
        self.metadata.store(Arc::new(next));
        info!(
            "Installed refreshed metadata for {}: expiration={expiration}",
            self.snapshot_id
        );
        Ok(())
    }

    fn fail(&self, err: BlockError) {
        error!(
            "Fatal metadata refresh failure for {}, stopping backend: {err}",
            self.snapshot_id
        );
        self.fatal.send_replace(Some(err));
        self.shutdown.cancel();
    }
}
