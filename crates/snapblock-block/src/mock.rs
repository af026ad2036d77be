//! In-memory [`SnapshotApi`] used by the test suites

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use snapblock_ebs::{BlockEntry, BlockListPage, EbsError, EbsResult, SnapshotApi, SnapshotBlock};

struct MockState {
    volume_size: u64,
    block_size: u64,
    blocks: BTreeSet<u64>,
    page_size: usize,
    generation: u64,
    base_expiration: DateTime<Utc>,
    fail_list_after_pages: Option<usize>,
    second_page_block_size: Option<u64>,
    second_page_volume_size: Option<u64>,
    fail_blocks: HashSet<u64>,
    corrupt_blocks: HashSet<u64>,
    get_delay: Option<Duration>,
}

pub(crate) struct MockSnapshotApi {
    state: Mutex<MockState>,
    list_calls: AtomicUsize,
    get_calls: Mutex<HashMap<u64, usize>>,
    tokens_seen: Mutex<Vec<String>>,
}

pub(crate) struct MockBuilder {
    volume_size: u64,
    block_size: u64,
    blocks: BTreeSet<u64>,
    page_size: usize,
    base_expiration: DateTime<Utc>,
}

impl MockBuilder {
    pub fn volume_size(mut self, gib: u64) -> Self {
        self.volume_size = gib;
        self
    }

    pub fn block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn blocks(mut self, indices: Range<u64>) -> Self {
        self.blocks = indices.collect();
        self
    }

    pub fn page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    pub fn expiration(mut self, at: DateTime<Utc>) -> Self {
        self.base_expiration = at;
        self
    }

    pub fn build(self) -> MockSnapshotApi {
        MockSnapshotApi {
            state: Mutex::new(MockState {
                volume_size: self.volume_size,
                block_size: self.block_size,
                blocks: self.blocks,
                page_size: self.page_size.max(1),
                generation: 0,
                base_expiration: self.base_expiration,
                fail_list_after_pages: None,
                second_page_block_size: None,
                second_page_volume_size: None,
                fail_blocks: HashSet::new(),
                corrupt_blocks: HashSet::new(),
                get_delay: None,
            }),
            list_calls: AtomicUsize::new(0),
            get_calls: Mutex::new(HashMap::new()),
            tokens_seen: Mutex::new(Vec::new()),
        }
    }
}

impl MockSnapshotApi {
    pub fn builder() -> MockBuilder {
        MockBuilder {
            volume_size: 1,
            block_size: 1024,
            blocks: (0..4).collect(),
            page_size: 100,
            base_expiration: Utc::now() + chrono::Duration::hours(1),
        }
    }

    /// Deterministic content of a listed block
    pub fn block_data(&self, index: u64) -> Bytes {
        let block_size = self.state.lock().block_size;
        pattern(index, block_size)
    }

    /// Token the most recent listing handed out for `index`
    pub fn token_for(&self, index: u64) -> String {
        format!("token-{}-{index}", self.state.lock().generation)
    }

    pub fn base_expiration(&self) -> DateTime<Utc> {
        self.state.lock().base_expiration
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self, index: u64) -> usize {
        self.get_calls.lock().get(&index).copied().unwrap_or(0)
    }

    pub fn total_get_calls(&self) -> usize {
        self.get_calls.lock().values().sum()
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().clone()
    }

    pub fn fail_list_after_pages(&self, pages: Option<usize>) {
        self.state.lock().fail_list_after_pages = pages;
    }

    pub fn set_second_page_block_size(&self, size: Option<u64>) {
        self.state.lock().second_page_block_size = size;
    }

    pub fn set_second_page_volume_size(&self, gib: Option<u64>) {
        self.state.lock().second_page_volume_size = gib;
    }

    pub fn set_volume_size(&self, gib: u64) {
        self.state.lock().volume_size = gib;
    }

    pub fn set_block_size(&self, bytes: u64) {
        self.state.lock().block_size = bytes;
    }

    pub fn set_expiration(&self, at: DateTime<Utc>) {
        self.state.lock().base_expiration = at;
    }

    pub fn fail_block(&self, index: u64, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_blocks.insert(index);
        } else {
            state.fail_blocks.remove(&index);
        }
    }

    pub fn corrupt_block(&self, index: u64) {
        self.state.lock().corrupt_blocks.insert(index);
    }

    pub fn set_get_delay(&self, delay: Option<Duration>) {
        self.state.lock().get_delay = delay;
    }
}

fn pattern(index: u64, block_size: u64) -> Bytes {
    (0..block_size)
        .map(|i| ((index * 31 + i) % 251) as u8)
        .collect::<Vec<_>>()
        .into()
}

fn page_number(next_token: Option<&str>) -> usize {
    next_token
        .and_then(|t| t.strip_prefix("page-"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl SnapshotApi for MockSnapshotApi {
    async fn list_snapshot_blocks(
        &self,
        _snapshot_id: &str,
        next_token: Option<&str>,
    ) -> EbsResult<BlockListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let page = page_number(next_token);
        let mut state = self.state.lock();

        if state.fail_list_after_pages.is_some_and(|n| page >= n) {
            return Err(EbsError::Api {
                status: 500,
                message: "listing failed".into(),
            });
        }
        if page == 0 {
            state.generation += 1;
        }

        let generation = state.generation;
        let blocks: Vec<BlockEntry> = state
            .blocks
            .iter()
            .skip(page * state.page_size)
            .take(state.page_size)
            .map(|&index| BlockEntry {
                index,
                token: format!("token-{generation}-{index}"),
            })
            .collect();
        let has_more = state.blocks.len() > (page + 1) * state.page_size;
        let block_size = match state.second_page_block_size {
            Some(size) if page == 1 => size,
            _ => state.block_size,
        };
        let volume_size = match state.second_page_volume_size {
            Some(gib) if page == 1 => gib,
            _ => state.volume_size,
        };

        Ok(BlockListPage {
            volume_size,
            block_size,
            expiry_time: state.base_expiration - chrono::Duration::minutes(page as i64),
            blocks,
            next_token: has_more.then(|| format!("page-{}", page + 1)),
        })
    }

    async fn get_snapshot_block(
        &self,
        _snapshot_id: &str,
        block_index: u64,
        block_token: &str,
    ) -> EbsResult<SnapshotBlock> {
        *self.get_calls.lock().entry(block_index).or_default() += 1;
        self.tokens_seen.lock().push(block_token.to_string());

        let delay = self.state.lock().get_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (block_size, fail, corrupt) = {
            let state = self.state.lock();
            (
                state.block_size,
                state.fail_blocks.contains(&block_index),
                state.corrupt_blocks.contains(&block_index),
            )
        };
        if fail {
            return Err(EbsError::Api {
                status: 500,
                message: format!("block {block_index} unavailable"),
            });
        }
        if !block_token.ends_with(&format!("-{block_index}")) {
            return Err(EbsError::Api {
                status: 400,
                message: "bad block token".into(),
            });
        }

        let data = pattern(block_index, block_size);
        let checksum = B64.encode(Sha256::digest(&data));
        let mut body_data = data.to_vec();
        if corrupt && !body_data.is_empty() {
            body_data[0] ^= 0xff;
        }
        let body = Bytes::from(body_data);
        let half = body.len() / 2;
        let chunks = vec![Ok(body.slice(..half)), Ok(body.slice(half..))];

        Ok(SnapshotBlock {
            data_length: Some(block_size),
            checksum: Some(checksum),
            checksum_algorithm: Some("SHA256".into()),
            body: Box::pin(futures::stream::iter(chunks)),
        })
    }
}
