//! snapblock EBS client
//!
//! Client for the read side of the EBS direct API:
//! `ListSnapshotBlocks` (paginated) and `GetSnapshotBlock` (streamed).
//! Built on the AWS SDK, so credentials come from the default provider
//! chain and retries follow the SDK's standard retry strategy.

pub mod api;
pub mod client;
pub mod error;
pub mod types;

pub use api::SnapshotApi;
pub use client::{EbsClient, EbsConfig};
pub use error::{EbsError, EbsResult};
pub use types::{BlockBody, BlockEntry, BlockListPage, SnapshotBlock};
