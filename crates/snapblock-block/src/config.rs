//! Backend configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::DEFAULT_CACHE_BLOCKS;

/// Snapshot backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Maximum number of remote blocks held in the block cache
    pub cache_capacity: u64,
    /// How long before metadata expiry a refresh is started
    #[serde(with = "duration_secs")]
    pub refresh_margin: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_BLOCKS,
            refresh_margin: Duration::from_secs(5 * 60),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
