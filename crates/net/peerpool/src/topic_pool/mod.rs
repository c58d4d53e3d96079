//! Per-topic pools.
//!
//! Each configured topic gets one pool. The variant is picked from the topic
//! name: [`MAIL_SERVER_DISCOVERY_TOPIC`] is cache-only, topics starting with
//! [`PROXY_TOPIC_PREFIX`] are proxied into a second discovery, everything else
//! is a [`StandardTopicPool`].

mod base;
mod cache_only;
mod proxy;
mod standard;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murmur_net_peer_cache::PeerCache;
use murmur_net_primitives::{ConnectionManager, Discovery, Node, NodeId, Topic};

use crate::config::{Limits, PeerPoolConfig};
use crate::error::{PeerPoolError, PeerPoolResult};
use crate::events::PoolEventEmitter;

pub use base::TopicPoolBase;
pub use cache_only::{CacheOnlyTopicPool, NodeVerifier};
pub use proxy::ProxyTopicPool;
pub use standard::StandardTopicPool;

/// Topic whose peers are harvested into the cache only.
pub const MAIL_SERVER_DISCOVERY_TOPIC: &str = "whispermail";

/// Prefix of topics forwarded into the proxy discovery.
pub const PROXY_TOPIC_PREFIX: &str = "proxy:";

/// Peer management for one discovery topic.
#[async_trait]
pub trait TopicPool: Send + Sync + fmt::Debug {
    fn topic(&self) -> &Topic;

    /// Start the topic search. Fails if discovery is not running.
    fn start_search(self: Arc<Self>, server: Arc<dyn ConnectionManager>) -> PeerPoolResult<()>;

    /// Stop the topic search and wait for its tasks. Idempotent.
    async fn stop_search(&self);

    fn search_running(&self) -> bool;

    /// No sync mode is selected, i.e. the search is not active.
    fn is_stopped(&self) -> bool;

    fn below_min(&self) -> bool;

    fn max_reached(&self) -> bool;

    fn limits(&self) -> Limits;

    fn set_limits(&self, limits: Limits);

    fn confirm_added(&self, server: &dyn ConnectionManager, id: &NodeId);

    /// Returns true when the drop left a gap the pool should try to fill.
    fn confirm_dropped(&self, server: &dyn ConnectionManager, id: &NodeId) -> bool;

    fn add_peer_from_table(&self, server: &dyn ConnectionManager) -> Option<Node>;

    fn connected_peers(&self) -> Vec<Node>;

    fn process_found_node(&self, server: &dyn ConnectionManager, node: Node);

    fn set_stop_search_timeout(&self, delay: Duration);

    fn ready_to_stop_search(&self) -> bool;
}

/// Collaborators shared by every topic pool of one peer pool.
#[derive(Clone)]
pub(crate) struct PoolContext {
    pub(crate) discovery: Arc<dyn Discovery>,
    pub(crate) proxy: Option<Arc<dyn Discovery>>,
    pub(crate) verifier: Option<Arc<dyn NodeVerifier>>,
    pub(crate) cache: PeerCache,
    pub(crate) config: PeerPoolConfig,
    pub(crate) events: PoolEventEmitter,
}

/// Build the pool variant for `topic`.
pub(crate) fn new_topic_pool(
    topic: Topic,
    limits: Limits,
    ctx: &PoolContext,
) -> PeerPoolResult<Arc<dyn TopicPool>> {
    let base = TopicPoolBase::new(
        topic.clone(),
        limits,
        Arc::clone(&ctx.discovery),
        ctx.cache.clone(),
        &ctx.config,
    );

    if topic.as_str() == MAIL_SERVER_DISCOVERY_TOPIC {
        return Ok(Arc::new(CacheOnlyTopicPool::new(
            base,
            ctx.verifier.clone(),
            ctx.events.clone(),
        )));
    }

    if topic.as_str().starts_with(PROXY_TOPIC_PREFIX) {
        let proxy = ctx
            .proxy
            .clone()
            .ok_or(PeerPoolError::MissingProxyDiscovery(topic))?;
        return Ok(Arc::new(ProxyTopicPool::new(base, proxy)));
    }

    Ok(Arc::new(StandardTopicPool::new(base)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use murmur_net_peer_cache::PeerCache;
    use murmur_net_primitives::{NodeId, Topic};
    use murmur_net_test_utils::{MockConnectionManager, MockDiscovery};

    use super::TopicPoolBase;
    use crate::config::{Limits, PeerPoolConfig};

    pub(crate) const FAST: Duration = Duration::from_millis(100);
    pub(crate) const SLOW: Duration = Duration::from_millis(200);

    pub(crate) fn test_config() -> PeerPoolConfig {
        PeerPoolConfig {
            fast_sync: FAST,
            slow_sync: SLOW,
            max_cached_peers_multiplier: 1,
            ..Default::default()
        }
    }

    pub(crate) fn server() -> MockConnectionManager {
        MockConnectionManager::new(NodeId::new([0xff; 32]))
    }

    pub(crate) fn base_with(
        topic: &str,
        limits: Limits,
        config: &PeerPoolConfig,
    ) -> (TopicPoolBase, Arc<MockDiscovery>, PeerCache) {
        let discovery = Arc::new(MockDiscovery::started());
        let cache = PeerCache::in_memory();
        let base = TopicPoolBase::new(
            Topic::from(topic),
            limits,
            discovery.clone(),
            cache.clone(),
            config,
        );
        (base, discovery, cache)
    }
}
