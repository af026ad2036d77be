//! Request and response types for the EBS direct API

use std::fmt;
use std::pin::Pin;

use aws_sdk_ebs::operation::list_snapshot_blocks::ListSnapshotBlocksOutput;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::{EbsError, EbsResult};

/// A block listed in a snapshot, with the token needed to read it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    /// Block index (byte offset / block size)
    pub index: u64,
    /// Opaque access token for `GetSnapshotBlock`
    pub token: String,
}

/// One page of a `ListSnapshotBlocks` response
#[derive(Debug, Clone)]
pub struct BlockListPage {
    /// Volume size in GiB
    pub volume_size: u64,
    /// Block size in bytes
    pub block_size: u64,
    /// Instant after which the tokens in this page stop working
    pub expiry_time: DateTime<Utc>,
    /// Blocks listed in this page
    pub blocks: Vec<BlockEntry>,
    /// Token for the next page, absent on the last page
    pub next_token: Option<String>,
}

/// Streamed block body
pub type BlockBody = Pin<Box<dyn Stream<Item = EbsResult<Bytes>> + Send>>;

/// Content of a single snapshot block as returned by `GetSnapshotBlock`
pub struct SnapshotBlock {
    /// Size of the block data, if the service sent it
    pub data_length: Option<u64>,
    /// Base64 checksum of the block data
    pub checksum: Option<String>,
    /// Checksum algorithm (only `SHA256` is defined)
    pub checksum_algorithm: Option<String>,
    /// Block data; must be drained completely
    pub body: BlockBody,
}

impl fmt::Debug for SnapshotBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotBlock")
            .field("data_length", &self.data_length)
            .field("checksum", &self.checksum)
            .field("checksum_algorithm", &self.checksum_algorithm)
            .finish_non_exhaustive()
    }
}

// ── SDK conversion ────────────────────────────────────────────────────────────

fn non_negative<T: TryInto<u64> + Copy + fmt::Display>(field: &str, value: T) -> EbsResult<u64> {
    value
        .try_into()
        .map_err(|_| EbsError::MalformedResponse(format!("negative {field} {value}")))
}

impl TryFrom<ListSnapshotBlocksOutput> for BlockListPage {
    type Error = EbsError;

    fn try_from(out: ListSnapshotBlocksOutput) -> EbsResult<Self> {
        let volume_size = out
            .volume_size()
            .ok_or_else(|| EbsError::MalformedResponse("missing VolumeSize".into()))?;
        let block_size = out
            .block_size()
            .ok_or_else(|| EbsError::MalformedResponse("missing BlockSize".into()))?;
        let expiry = out
            .expiry_time()
            .ok_or_else(|| EbsError::MalformedResponse("missing ExpiryTime".into()))?;

        let expiry_time = DateTime::from_timestamp(expiry.secs(), expiry.subsec_nanos())
            .ok_or_else(|| EbsError::MalformedResponse(format!("bad ExpiryTime {expiry}")))?;

        let blocks = out
            .blocks()
            .iter()
            .map(|b| {
                let index = b
                    .block_index()
                    .ok_or_else(|| EbsError::MalformedResponse("block without BlockIndex".into()))?;
                let token = b.block_token().ok_or_else(|| {
                    EbsError::MalformedResponse(format!("block {index} without BlockToken"))
                })?;
                Ok(BlockEntry {
                    index: non_negative("BlockIndex", index)?,
                    token: token.to_string(),
                })
            })
            .collect::<EbsResult<Vec<_>>>()?;

        Ok(Self {
            volume_size: non_negative("VolumeSize", volume_size)?,
            block_size: non_negative("BlockSize", block_size)?,
            expiry_time,
            blocks,
            // An empty token is the same as no token
            next_token: out.next_token().filter(|t| !t.is_empty()).map(str::to_string),
        })
    }
}
