//! Peer pool configuration (TOML-serializable).

use std::collections::BTreeMap;
use std::time::Duration;

use murmur_net_primitives::Topic;
use serde::{Deserialize, Serialize};

use crate::error::PeerPoolResult;

/// Lookup interval while a topic is below its minimum.
pub const DEFAULT_FAST_SYNC: Duration = Duration::from_secs(3);
/// Lookup interval once a topic is satisfied.
pub const DEFAULT_SLOW_SYNC: Duration = Duration::from_secs(30);
/// Discovery is stopped after this long without reaching limits.
pub const DEFAULT_DISC_SERVER_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Delay between reaching max peers and stopping the topic search.
pub const DEFAULT_TOPIC_STOP_SEARCH_DELAY: Duration = Duration::from_secs(10);
/// Fast mode reverts to slow mode after this long.
pub const DEFAULT_TOPIC_FAST_MODE_TIMEOUT: Duration = Duration::from_secs(30);
/// `max` limit times this gives the number of cached peers kept per topic.
pub const DEFAULT_MAX_CACHED_PEERS_MULTIPLIER: usize = 2;

/// Peers discovered longer ago than this are not dialed from the queue.
pub const EXPIRATION_PERIOD: Duration = Duration::from_secs(60 * 60);
/// Backoff between failed discovery restarts.
pub const DISCOVERY_RESTART_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection bounds for one topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub min: usize,
    pub max: usize,
}

impl Limits {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }
}

/// Peer pool options.
///
/// Durations are written as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerPoolConfig {
    #[serde(with = "millis")]
    pub fast_sync: Duration,

    #[serde(with = "millis")]
    pub slow_sync: Duration,

    /// Zero disables the discovery timeout.
    #[serde(with = "millis")]
    pub disc_server_timeout: Duration,

    /// Whether discovery may be stopped once every topic is satisfied.
    pub allow_stop: bool,

    #[serde(with = "millis")]
    pub topic_stop_search_delay: Duration,

    /// Zero keeps fast mode until the minimum is reached.
    #[serde(with = "millis")]
    pub fast_mode_timeout: Duration,

    pub max_cached_peers_multiplier: usize,
}

impl Default for PeerPoolConfig {
    fn default() -> Self {
        Self {
            fast_sync: DEFAULT_FAST_SYNC,
            slow_sync: DEFAULT_SLOW_SYNC,
            disc_server_timeout: DEFAULT_DISC_SERVER_TIMEOUT,
            allow_stop: true,
            topic_stop_search_delay: DEFAULT_TOPIC_STOP_SEARCH_DELAY,
            fast_mode_timeout: DEFAULT_TOPIC_FAST_MODE_TIMEOUT,
            max_cached_peers_multiplier: DEFAULT_MAX_CACHED_PEERS_MULTIPLIER,
        }
    }
}

impl PeerPoolConfig {
    /// Parse options from TOML; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> PeerPoolResult<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Topics with their limits plus pool options, as loaded from one file.
///
/// ```toml
/// fast_sync = 3000
/// allow_stop = false
///
/// [topics.whisper]
/// min = 2
/// max = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(flatten)]
    pub options: PeerPoolConfig,

    #[serde(default)]
    pub topics: BTreeMap<Topic, Limits>,
}

impl PoolSettings {
    pub fn from_toml_str(s: &str) -> PeerPoolResult<Self> {
        Ok(toml::from_str(s)?)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
