//! The discovery capability consumed by topic searches.
//!
//! Implementations wrap a Kademlia-style topic discovery service. The pool only
//! needs the lifecycle calls and a blocking topic search that reports found
//! nodes over a channel.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::node::Node;
use crate::topic::Topic;

/// Receives the lookup cadence for a running topic search.
///
/// Closed by the topic pool when the search stops; [`Discovery::discover`]
/// must return once it observes the closed channel.
pub type PeriodReceiver = mpsc::UnboundedReceiver<Duration>;

/// Publishes the lookup cadence to a running topic search.
pub type PeriodSender = mpsc::UnboundedSender<Duration>;

/// Carries nodes found by a topic search back to the pool.
pub type FoundSender = mpsc::Sender<Node>;

/// Signals that a lookup round finished (`true` when it produced results).
pub type LookupSender = mpsc::Sender<bool>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery is not running")]
    NotRunning,
    #[error("failed to start discovery: {0}")]
    Start(String),
    #[error("failed to stop discovery: {0}")]
    Stop(String),
    #[error("topic search failed for {topic}: {reason}")]
    Search { topic: Topic, reason: String },
    #[error("failed to insert nodes for {topic}: {reason}")]
    Insert { topic: Topic, reason: String },
}

#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    fn running(&self) -> bool;

    async fn start(&self) -> Result<(), DiscoveryError>;

    async fn stop(&self) -> Result<(), DiscoveryError>;

    /// Run a topic search until `period` is closed.
    ///
    /// Each value received on `period` replaces the current lookup interval.
    /// Found nodes are sent on `found`; every completed lookup round is
    /// reported on `lookup`.
    async fn discover(
        &self,
        topic: Topic,
        period: PeriodReceiver,
        found: FoundSender,
        lookup: LookupSender,
    ) -> Result<(), DiscoveryError>;

    /// Seed the routing table of a topic with known nodes.
    fn insert_nodes(&self, topic: &Topic, nodes: Vec<Node>) -> Result<(), DiscoveryError>;
}
