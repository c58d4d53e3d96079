//! Topic-based peer pool.
//!
//! Keeps the number of connections per discovery topic within configured
//! limits, switching the topic search between fast and slow lookups and
//! stopping discovery once every topic is satisfied.

pub mod config;
pub mod error;
pub mod events;
mod metrics;
mod peer;
pub mod pool;
mod queue;
pub mod topic_pool;

pub use config::{
    DISCOVERY_RESTART_TIMEOUT, EXPIRATION_PERIOD, Limits, PeerPoolConfig, PoolSettings,
};
pub use error::{PeerPoolError, PeerPoolResult};
pub use events::{PoolEvent, PoolEventEmitter};
pub use pool::PeerPool;
pub use topic_pool::{
    CacheOnlyTopicPool, MAIL_SERVER_DISCOVERY_TOPIC, NodeVerifier, PROXY_TOPIC_PREFIX,
    ProxyTopicPool, StandardTopicPool, TopicPool, TopicPoolBase,
};
