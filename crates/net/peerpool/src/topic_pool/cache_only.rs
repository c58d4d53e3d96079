//! Topic pool that only harvests peers into the cache.
//!
//! Connections are kept just long enough to confirm and cache the peer. The
//! pool counts as full once the cache holds `max` peers for the topic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use auto_impl::auto_impl;
use murmur_net_primitives::{ConnectionManager, Node, NodeId, Topic};
use tracing::{debug, error};

use super::{TopicPool, TopicPoolBase};
use crate::config::Limits;
use crate::error::PeerPoolResult;
use crate::events::PoolEventEmitter;

/// Decides whether a connected peer may be cached.
#[auto_impl(&, Box, Arc)]
pub trait NodeVerifier: Send + Sync + fmt::Debug {
    fn verify_node(&self, id: &NodeId) -> bool;
}

pub struct CacheOnlyTopicPool {
    base: TopicPoolBase,
    verifier: Option<Arc<dyn NodeVerifier>>,
    events: PoolEventEmitter,
}

impl fmt::Debug for CacheOnlyTopicPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOnlyTopicPool")
            .field("base", &self.base)
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

impl CacheOnlyTopicPool {
    pub fn new(
        base: TopicPoolBase,
        verifier: Option<Arc<dyn NodeVerifier>>,
        events: PoolEventEmitter,
    ) -> Self {
        Self {
            base,
            verifier,
            events,
        }
    }

    fn verified(&self, id: &NodeId) -> bool {
        self.verifier
            .as_ref()
            .is_none_or(|verifier| verifier.verify_node(id))
    }
}

#[async_trait]
impl TopicPool for CacheOnlyTopicPool {
    fn topic(&self) -> &Topic {
        self.base.topic()
    }

    fn start_search(self: Arc<Self>, server: Arc<dyn ConnectionManager>) -> PeerPoolResult<()> {
        let pool = Arc::downgrade(&self);
        let handler_server = Arc::clone(&server);
        self.base.start_search(&*server, move |node| {
            if let Some(pool) = pool.upgrade() {
                pool.process_found_node(&*handler_server, node);
            }
        })
    }

    async fn stop_search(&self) {
        self.base.stop_search().await;
    }

    fn search_running(&self) -> bool {
        self.base.search_running()
    }

    fn is_stopped(&self) -> bool {
        self.base.is_stopped()
    }

    fn below_min(&self) -> bool {
        self.base.below_min()
    }

    /// The cache holds at least `max` peers for the topic.
    fn max_reached(&self) -> bool {
        let max = self.base.limits().max;
        if max == 0 {
            return true;
        }
        match self.base.cache().count(self.topic(), max) {
            Ok(count) => count >= max,
            Err(e) => {
                error!(topic = %self.topic(), error = %e, "failed to count cached peers");
                false
            }
        }
    }

    fn limits(&self) -> Limits {
        self.base.limits()
    }

    fn set_limits(&self, limits: Limits) {
        self.base.set_limits(limits);
    }

    fn confirm_added(&self, server: &dyn ConnectionManager, id: &NodeId) {
        if self.base.pending_node(id).is_none() {
            return;
        }
        if !self.verified(id) {
            debug!(topic = %self.topic(), %id, "peer failed verification");
            self.base.forget_peer(server, id);
            return;
        }

        let Some(node) = self.base.confirm_added(server, id) else {
            return;
        };
        self.events.peer_discovered(self.topic().clone(), node);
        // cached, the connection itself is not needed
        self.base.release_peer(server, id);
    }

    fn confirm_dropped(&self, server: &dyn ConnectionManager, id: &NodeId) -> bool {
        self.base.confirm_dropped(server, id)
    }

    fn add_peer_from_table(&self, server: &dyn ConnectionManager) -> Option<Node> {
        self.base.add_peer_from_table(server)
    }

    fn connected_peers(&self) -> Vec<Node> {
        self.base.connected_peers()
    }

    fn process_found_node(&self, server: &dyn ConnectionManager, node: Node) {
        self.base.process_found_node(server, node);
    }

    fn set_stop_search_timeout(&self, delay: Duration) {
        self.base.set_stop_search_timeout(delay);
    }

    fn ready_to_stop_search(&self) -> bool {
        self.base.ready_to_stop_search()
    }
}
