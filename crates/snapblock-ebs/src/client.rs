//! EBS direct API client on the AWS SDK

use std::time::Duration;

use async_trait::async_trait;
use aws_config::profile::profile_file::ProfileFiles;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_ebs::Client;
use aws_sdk_ebs::config::Region;
use aws_sdk_ebs::primitives::ByteStream;
use tracing::debug;

use crate::api::SnapshotApi;
use crate::error::{EbsError, EbsResult};
use crate::types::{BlockBody, BlockListPage, SnapshotBlock};

/// EBS client configuration
#[derive(Debug, Clone)]
pub struct EbsConfig {
    /// AWS region of the snapshot
    pub region: String,
    /// Custom endpoint URL (defaults to the regional endpoint)
    pub endpoint: Option<String>,
    /// Named profile for the shared config and credentials files
    pub profile: Option<String>,
    /// Maximum attempts for a request that fails transiently (default: 3)
    pub max_attempts: u32,
    /// Initial backoff between attempts (default: 100ms)
    pub retry_base_delay: Duration,
    /// Per-attempt timeout (default: 60s)
    pub request_timeout: Duration,
    /// `MaxResults` for block listings; service default when unset
    pub list_page_size: Option<u32>,
}

impl Default for EbsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            profile: None,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(60),
            list_page_size: None,
        }
    }
}

impl EbsConfig {
    /// Configuration for a region with all other settings defaulted
    pub fn for_region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig::standard()
            .with_max_attempts(self.max_attempts.max(1))
            .with_initial_backoff(self.retry_base_delay)
    }

    fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::builder()
            .operation_attempt_timeout(self.request_timeout)
            .build()
    }
}

/// Load the shared AWS configuration: default credentials chain (environment,
/// profile files, web identity, container and instance metadata) plus the
/// region, retry and timeout settings from `config`
async fn load_sdk_config(config: &EbsConfig, profile_files: Option<ProfileFiles>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .retry_config(config.retry_config())
        .timeout_config(config.timeout_config());
    if let Some(profile) = &config.profile {
        loader = loader.profile_name(profile);
    }
    if let Some(files) = profile_files {
        loader = loader.profile_files(files);
    }
    loader.load().await
}

/// Client for the EBS direct API
#[derive(Debug, Clone)]
pub struct EbsClient {
    inner: Client,
    credentials: Option<SharedCredentialsProvider>,
    config: EbsConfig,
}

impl EbsClient {
    /// Create a client using the default AWS credentials chain
    pub async fn new(config: EbsConfig) -> Self {
        let sdk_config = load_sdk_config(&config, None).await;
        Self::from_sdk_config(&sdk_config, config)
    }

    /// Create a client from an already loaded SDK configuration
    pub fn from_sdk_config(sdk_config: &SdkConfig, config: EbsConfig) -> Self {
        let mut builder = aws_sdk_ebs::config::Builder::from(sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            inner: Client::from_conf(builder.build()),
            credentials: sdk_config.credentials_provider(),
            config,
        }
    }

    /// Resolve credentials once so a misconfigured host fails at startup
    /// rather than on the first read
    pub async fn check_credentials(&self) -> EbsResult<()> {
        let provider = self
            .credentials
            .as_ref()
            .ok_or(EbsError::MissingCredentials)?;
        provider
            .provide_credentials()
            .await
            .map_err(|e| EbsError::Credentials(e.to_string()))?;
        debug!("Resolved AWS credentials for {}", self.config.region);
        Ok(())
    }

    pub fn config(&self) -> &EbsConfig {
        &self.config
    }
}

/// Expose a block body as a stream of chunks
fn body_stream(body: ByteStream) -> BlockBody {
    Box::pin(futures::stream::unfold(body, |mut body| async move {
        body.next()
            .await
            .map(|chunk| (chunk.map_err(|e| EbsError::Body(e.to_string())), body))
    }))
}

#[async_trait]
impl SnapshotApi for EbsClient {
    async fn list_snapshot_blocks(
        &self,
        snapshot_id: &str,
        next_token: Option<&str>,
    ) -> EbsResult<BlockListPage> {
        let max_results = self
            .config
            .list_page_size
            .map(|n| {
                i32::try_from(n)
                    .map_err(|_| EbsError::InvalidRequest(format!("list page size {n}")))
            })
            .transpose()?;

        let out = self
            .inner
            .list_snapshot_blocks()
            .snapshot_id(snapshot_id)
            .set_max_results(max_results)
            .set_next_token(next_token.map(str::to_string))
            .send()
            .await
            .map_err(EbsError::from_sdk)?;

        let page = BlockListPage::try_from(out)?;
        debug!(
            "Listed {} blocks of {snapshot_id} (more: {})",
            page.blocks.len(),
            page.next_token.is_some()
        );
        Ok(page)
    }

    async fn get_snapshot_block(
        &self,
        snapshot_id: &str,
        block_index: u64,
        block_token: &str,
    ) -> EbsResult<SnapshotBlock> {
        let index = i32::try_from(block_index)
            .map_err(|_| EbsError::InvalidRequest(format!("block index {block_index}")))?;

        let out = self
            .inner
            .get_snapshot_block()
            .snapshot_id(snapshot_id)
            .block_index(index)
            .block_token(block_token)
            .send()
            .await
            .map_err(EbsError::from_sdk)?;

        let data_length = out
            .data_length()
            .map(|len| {
                u64::try_from(len)
                    .map_err(|_| EbsError::MalformedResponse(format!("negative DataLength {len}")))
            })
            .transpose()?;
        let checksum = out.checksum().map(str::to_string);
        let checksum_algorithm = out.checksum_algorithm().map(|a| a.as_str().to_string());

        Ok(SnapshotBlock {
            data_length,
            checksum,
            checksum_algorithm,
            body: body_stream(out.block_data),
        })
    }
}
