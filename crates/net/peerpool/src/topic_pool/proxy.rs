//! Topic pool that bridges found peers into a second discovery.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use murmur_net_primitives::{ConnectionManager, Discovery, Node, NodeId, Topic};
use tracing::{error, trace};

use super::{TopicPool, TopicPoolBase};
use crate::config::Limits;
use crate::error::PeerPoolResult;

/// Forwards every found node into the proxy discovery's routing table and
/// never connects. `below_min` counts forwarded nodes instead of connections.
pub struct ProxyTopicPool {
    base: TopicPoolBase,
    proxy: Arc<dyn Discovery>,
    found: AtomicUsize,
}

impl fmt::Debug for ProxyTopicPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTopicPool")
            .field("base", &self.base)
            .field("found", &self.found.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ProxyTopicPool {
    pub fn new(base: TopicPoolBase, proxy: Arc<dyn Discovery>) -> Self {
        Self {
            base,
            proxy,
            found: AtomicUsize::new(0),
        }
    }

    /// Nodes successfully forwarded so far.
    pub fn found(&self) -> usize {
        self.found.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopicPool for ProxyTopicPool {
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
        self.found() < self.base.limits().min
    }

    fn max_reached(&self) -> bool {
        false
    }

    fn limits(&self) -> Limits {
        self.base.limits()
    }

    fn set_limits(&self, limits: Limits) {
        self.base.set_limits(limits);
    }

    fn confirm_added(&self, _server: &dyn ConnectionManager, _id: &NodeId) {}

    fn confirm_dropped(&self, _server: &dyn ConnectionManager, _id: &NodeId) -> bool {
        false
    }

    fn add_peer_from_table(&self, _server: &dyn ConnectionManager) -> Option<Node> {
        None
    }

    fn connected_peers(&self) -> Vec<Node> {
        Vec::new()
    }

    fn process_found_node(&self, _server: &dyn ConnectionManager, node: Node) {
        let id = node.id;
        match self.proxy.insert_nodes(self.topic(), vec![node]) {
            Ok(()) => {
                self.found.fetch_add(1, Ordering::SeqCst);
                self.base.metrics().inc_found();
                trace!(topic = %self.topic(), %id, "node forwarded to proxy discovery");
            }
            Err(e) => {
                error!(topic = %self.topic(), %id, error = %e, "failed to forward node");
            }
        }
    }

    fn set_stop_search_timeout(&self, delay: Duration) {
        self.base.set_stop_search_timeout(delay);
    }

    fn ready_to_stop_search(&self) -> bool {
        self.base.ready_to_stop_search()
    }
}
