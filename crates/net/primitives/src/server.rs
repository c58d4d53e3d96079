//! The connection manager seam: peer add/remove requests and connection events.

use std::fmt::Debug;

use auto_impl::auto_impl;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::node::{Node, NodeId};

/// Connection events published by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPeerEvent {
    /// A connection with the peer was established.
    Added(NodeId),
    /// The connection with the peer was closed, by either side.
    Dropped(NodeId),
}

/// Summary of a live connection, reported in discovery summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPeerInfo {
    pub id: NodeId,
    pub name: String,
    pub remote_addr: String,
    pub inbound: bool,
}

/// Connection manager consumed by topic pools.
///
/// `add_peer` and `remove_peer` are requests: the outcome is observed later as
/// a [`ServerPeerEvent`] on the subscription.
#[auto_impl(&, Box, Arc)]
pub trait ConnectionManager: Send + Sync + Debug {
    /// Identity of the local node. Discovery results for it are ignored.
    fn local_id(&self) -> NodeId;

    fn add_peer(&self, node: &Node);

    fn remove_peer(&self, node: &Node);

    /// Subscribe to connection events. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<ServerPeerEvent>;

    fn peers_info(&self) -> Vec<ConnectedPeerInfo>;
}

