//! Shared types for topic-based peer discovery.
//!
//! Defines the node records exchanged with discovery, the [`Discovery`]
//! capability and the [`ConnectionManager`] seam used by the peer pool.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod discovery;
pub mod node;
pub mod server;
pub mod topic;

pub use discovery::{
    Discovery, DiscoveryError, FoundSender, LookupSender, PeriodReceiver, PeriodSender,
};
pub use node::{NODE_ID_LEN, Node, NodeId, NodeIdError};
pub use server::{ConnectedPeerInfo, ConnectionManager, ServerPeerEvent};
pub use topic::Topic;
