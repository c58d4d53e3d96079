//! Peer pool errors.

use murmur_net_primitives::{DiscoveryError, Topic};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerPoolError {
    #[error("discovery is not running")]
    DiscoveryNotRunning,
    #[error("peer pool already started")]
    AlreadyStarted,
    #[error("topic not found: {0}")]
    TopicNotFound(Topic),
    #[error("malformed topic config: {0} requires a proxy discovery")]
    MissingProxyDiscovery(Topic),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("invalid config: {0}")]
    Config(String),
}

impl From<toml::de::Error> for PeerPoolError {
    fn from(err: toml::de::Error) -> Self {
        PeerPoolError::Config(err.to_string())
    }
}

pub type PeerPoolResult<T> = Result<T, PeerPoolError>;
