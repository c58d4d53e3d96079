//! Topic pool that keeps live connections within the topic limits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murmur_net_primitives::{ConnectionManager, Node, NodeId, Topic};

use super::{TopicPool, TopicPoolBase};
use crate::config::Limits;
use crate::error::PeerPoolResult;

#[derive(Debug)]
pub struct StandardTopicPool {
    base: TopicPoolBase,
}

impl StandardTopicPool {
    pub fn new(base: TopicPoolBase) -> Self {
        Self { base }
    }
}

#[async_trait]
impl TopicPool for StandardTopicPool {
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

    fn max_reached(&self) -> bool {
        self.base.max_reached()
    }

    fn limits(&self) -> Limits {
        self.base.limits()
    }

    fn set_limits(&self, limits: Limits) {
        self.base.set_limits(limits);
    }

    fn confirm_added(&self, server: &dyn ConnectionManager, id: &NodeId) {
        self.base.confirm_added(server, id);
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

#[cfg(test)]
mod tests {
    use std::future::{Future, poll_fn};
    use std::pin::pin;
    use std::sync::Arc;
    use std::task::Poll;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use murmur_net_primitives::Discovery;
    use murmur_net_test_utils::{random_node, random_nodes, wait_until};

    use super::*;
    use crate::config::{EXPIRATION_PERIOD, PeerPoolConfig};
    use crate::error::PeerPoolError;
    use crate::topic_pool::test_support::{FAST, SLOW, base_with, server, test_config};

    fn pool_with(limits: Limits) -> StandardTopicPool {
        let (base, _, _) = base_with("cap=cap1", limits, &test_config());
        StandardTopicPool::new(base)
    }

    fn cached_ids(pool: &StandardTopicPool) -> Vec<NodeId> {
        let topic = pool.topic().clone();
        let mut ids: Vec<_> = pool
            .base
            .cache()
            .get_peers_range(&topic, 10)
            .unwrap()
            .into_iter()
            .map(|node| node.id)
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_repeated_discovery_does_not_duplicate() {
        let server = server();
        let pool = pool_with(Limits::new(1, 2));
        let node = random_node(32311);

        pool.process_found_node(&server, node.clone());
        pool.process_found_node(&server, node.clone());

        let state = pool.base.state();
        assert_eq!(state.pending.len(), 1);
        assert!(state.connected.is_empty());
        assert!(state.queue.is_empty());
    }

    #[test]
    fn test_found_node_connects_below_cached_bound() {
        let server = server();
        // max_cached_peers = 1
        let pool = pool_with(Limits::new(1, 1));
        let [a, b]: [Node; 2] = random_nodes(2, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.confirm_added(&server, &a.id);
        pool.process_found_node(&server, b.clone());

        assert!(server.was_added(&a.id));
        assert!(!server.was_added(&b.id));
        assert!(pool.base.state().queue.contains(&b.id));
    }

    #[test]
    fn test_using_cache() {
        let server = server();
        let pool = pool_with(Limits::new(1, 1));
        let [a, b]: [Node; 2] = random_nodes(2, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.process_found_node(&server, b.clone());
        pool.confirm_added(&server, &a.id);
        pool.confirm_added(&server, &b.id);

        let mut both = vec![a.id, b.id];
        both.sort();
        assert_eq!(cached_ids(&pool), both);

        // b was dismissed by the pool, the cache keeps it
        assert!(!pool.confirm_dropped(&server, &b.id));
        assert_eq!(cached_ids(&pool), both);

        // a left on its own and is forgotten
        assert!(pool.confirm_dropped(&server, &a.id));
        assert_eq!(cached_ids(&pool), vec![b.id]);
    }

    #[test]
    fn test_requested_drop_keeps_peer_pending() {
        let server = server();
        let pool = pool_with(Limits::new(1, 1));
        let [a, b]: [Node; 2] = random_nodes(2, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.process_found_node(&server, b.clone());
        pool.confirm_added(&server, &a.id);
        pool.confirm_added(&server, &b.id);
        {
            let state = pool.base.state();
            assert!(!state.connected[&a.id].dismissed);
            assert!(state.connected[&b.id].dismissed);
        }
        assert!(server.was_removed(&b.id));

        pool.confirm_dropped(&server, &b.id);
        {
            let state = pool.base.state();
            assert!(state.pending.contains_key(&b.id));
            assert!(state.queue.contains(&b.id));
            assert!(!state.connected.contains_key(&b.id));
        }

        pool.confirm_dropped(&server, &a.id);
        let state = pool.base.state();
        assert!(!state.pending.contains_key(&a.id));
        assert!(!state.connected.contains_key(&a.id));
    }

    #[test]
    fn test_overflow_boundary() {
        let server = server();
        let pool = pool_with(Limits::new(1, 1));
        let [a, b]: [Node; 2] = random_nodes(2, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.process_found_node(&server, b.clone());
        pool.confirm_added(&server, &a.id);
        assert!(pool.max_reached());

        // one over max is no longer "reached"
        pool.confirm_added(&server, &b.id);
        assert!(!pool.max_reached());
        assert_eq!(pool.connected_peers().len(), 2);

        pool.confirm_dropped(&server, &b.id);
        assert!(pool.max_reached());
    }

    #[test]
    fn test_new_peer_selected_on_drop() {
        let server = server();
        // max_cached_peers = 2
        let pool = pool_with(Limits::new(1, 2));
        let [a, b, c]: [Node; 3] = random_nodes(3, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.process_found_node(&server, b.clone());
        pool.process_found_node(&server, c.clone());
        {
            let state = pool.base.state();
            assert_eq!(state.pending.len(), 3);
            assert!(state.queue.is_empty());
        }

        pool.confirm_added(&server, &a.id);
        pool.confirm_added(&server, &b.id);
        pool.confirm_added(&server, &c.id);
        pool.confirm_dropped(&server, &c.id);
        {
            let state = pool.base.state();
            assert!(state.pending.contains_key(&c.id));
            assert_eq!(state.pending.len(), 1);
            assert_eq!(state.queue.len(), 1);
        }

        assert!(pool.confirm_dropped(&server, &a.id));
        assert!(!pool.base.state().connected.contains_key(&a.id));

        assert_eq!(pool.add_peer_from_table(&server).map(|n| n.id), Some(c.id));
        let state = pool.base.state();
        assert_eq!(state.pending.len(), 1);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn test_most_recent_peer_is_selected() {
        let server = server();
        let pool = pool_with(Limits::new(1, 1));
        let [a, b, c]: [Node; 3] = random_nodes(3, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.process_found_node(&server, b.clone());
        pool.process_found_node(&server, c.clone());
        pool.confirm_added(&server, &a.id);
        pool.confirm_added(&server, &b.id);
        pool.confirm_added(&server, &c.id);

        pool.confirm_dropped(&server, &b.id);
        pool.confirm_dropped(&server, &c.id);
        pool.confirm_dropped(&server, &a.id);

        {
            let state = pool.base.state();
            assert!(state.pending[&b.id].discovered_at <= state.pending[&c.id].discovered_at);
        }
        assert_eq!(pool.add_peer_from_table(&server).map(|n| n.id), Some(c.id));
    }

    #[test]
    fn test_select_peer_after_max_limit() {
        let server = server();
        let pool = pool_with(Limits::new(1, 1));
        let [a, b, c]: [Node; 3] = random_nodes(3, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.process_found_node(&server, b.clone());
        pool.confirm_added(&server, &a.id);
        pool.confirm_added(&server, &b.id);
        pool.confirm_dropped(&server, &b.id);
        {
            let state = pool.base.state();
            assert_eq!(state.pending.len(), 1);
            assert!(state.pending.contains_key(&b.id));
        }

        pool.process_found_node(&server, c.clone());
        {
            let state = pool.base.state();
            assert_eq!(state.pending.len(), 2);
            assert!(state.pending.contains_key(&c.id));
        }
        assert_eq!(pool.add_peer_from_table(&server), Some(c));
    }

    #[test]
    fn test_peer_not_added_twice() {
        let server = server();
        let pool = pool_with(Limits::new(1, 1));
        let [a, b]: [Node; 2] = random_nodes(2, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.process_found_node(&server, b);
        pool.confirm_added(&server, &a.id);

        // b was already handed to the connection manager
        assert_eq!(pool.add_peer_from_table(&server), None);
    }

    #[test]
    fn test_max_cached_peers() {
        let server = server();
        let pool = pool_with(Limits::new(1, 1));
        pool.base.state().max_cached_peers = 3;
        let [a, b, c]: [Node; 3] = random_nodes(3, 32311).try_into().unwrap();

        for node in [&a, &b, &c] {
            pool.process_found_node(&server, node.clone());
        }
        for node in [&a, &b, &c] {
            pool.confirm_added(&server, &node.id);
        }

        {
            let state = pool.base.state();
            assert_eq!(state.connected.len(), 3);
            assert!(!state.connected[&a.id].dismissed);
            assert!(state.connected[&b.id].dismissed);
            assert!(state.connected[&c.id].dismissed);
        }
        assert_eq!(cached_ids(&pool).len(), 3);

        pool.confirm_dropped(&server, &b.id);
        pool.confirm_dropped(&server, &c.id);

        {
            let state = pool.base.state();
            assert!(state.connected.contains_key(&a.id));
            assert!(!state.connected.contains_key(&b.id));
            assert!(!state.connected.contains_key(&c.id));
            assert!(!state.pending.contains_key(&a.id));
            assert!(state.pending.contains_key(&b.id));
            assert!(state.pending.contains_key(&c.id));
        }

        assert!(pool.base.max_cached_peers_reached());
        assert!(pool.ready_to_stop_search());
        assert_eq!(cached_ids(&pool).len(), 3);
    }

    #[test]
    fn test_zero_limits_ignore_inbound() {
        let server = server();
        let pool = pool_with(Limits::new(0, 0));
        let a = random_node(32311);

        pool.process_found_node(&server, a.clone());
        assert!(pool.base.state().pending.contains_key(&a.id));
        assert!(!server.was_added(&a.id));

        // an inbound connection for an unknown peer is ignored
        let stranger = random_node(32312);
        pool.confirm_added(&server, &stranger.id);
        assert!(pool.connected_peers().is_empty());
        assert!(pool.base.max_cached_peers_reached());
    }

    #[test]
    fn test_connected_but_removed() {
        let server = server();
        let pool = pool_with(Limits::new(0, 0));
        pool.base.state().max_cached_peers = 1;
        let a = random_node(32311);

        pool.process_found_node(&server, a.clone());
        pool.confirm_added(&server, &a.id);
        assert!(pool.base.state().connected.contains_key(&a.id));
        assert!(server.was_removed(&a.id));

        assert!(!pool.confirm_dropped(&server, &a.id));
        assert!(pool.base.state().pending.contains_key(&a.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_peer_is_not_dialed() {
        let server = server();
        let pool = pool_with(Limits::new(1, 1));
        let [a, b]: [Node; 2] = random_nodes(2, 32311).try_into().unwrap();

        pool.process_found_node(&server, a.clone());
        pool.confirm_added(&server, &a.id);
        pool.process_found_node(&server, b.clone());
        assert!(pool.base.state().queue.contains(&b.id));

        tokio::time::advance(EXPIRATION_PERIOD + Duration::from_secs(1)).await;

        assert_eq!(pool.add_peer_from_table(&server), None);
        // stale peers are not queued again
        assert!(pool.base.state().queue.is_empty());
        assert!(!server.was_added(&b.id));
    }

    #[test]
    fn test_sync_switches() {
        let server = server();
        let config = PeerPoolConfig {
            fast_mode_timeout: Duration::ZERO,
            ..test_config()
        };
        let (base, _, _) = base_with("cap=cap1", Limits::new(1, 2), &config);
        let pool = StandardTopicPool::new(base);
        let mut period = pool.base.attach_period();
        let a = random_node(32311);

        pool.process_found_node(&server, a.clone());
        pool.confirm_added(&server, &a.id);
        assert_eq!(period.try_recv().unwrap(), SLOW);
        assert!(pool.base.state().connected.contains_key(&a.id));

        pool.confirm_dropped(&server, &a.id);
        assert_eq!(period.try_recv().unwrap(), FAST);
        assert!(period.try_recv().is_err());
    }

    #[test]
    fn test_set_sync_mode() {
        let config = PeerPoolConfig {
            fast_mode_timeout: Duration::ZERO,
            ..test_config()
        };
        let (base, _, _) = base_with("cap=cap1", Limits::new(1, 2), &config);
        let mut period = base.attach_period();

        base.set_sync_mode(FAST);
        assert_eq!(period.try_recv().unwrap(), FAST);
        assert_eq!(base.state().current_mode, Some(FAST));
        assert!(!base.has_fast_mode_timer());

        // same mode publishes nothing
        base.set_sync_mode(FAST);
        assert!(period.try_recv().is_err());

        base.set_sync_mode(SLOW);
        assert_eq!(period.try_recv().unwrap(), SLOW);
        assert_eq!(base.state().current_mode, Some(SLOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_mode_times_out() {
        let config = PeerPoolConfig {
            fast_mode_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (base, _, _) = base_with("cap=cap1", Limits::new(1, 2), &config);
        let mut period = base.attach_period();

        base.set_sync_mode(base.modes().fast);
        assert_eq!(period.recv().await, Some(FAST));
        assert!(base.has_fast_mode_timer());

        let mode = tokio::time::timeout(Duration::from_millis(100), period.recv())
            .await
            .unwrap();
        assert_eq!(mode, Some(SLOW));
        assert_eq!(base.state().current_mode, Some(SLOW));
        assert!(!base.has_fast_mode_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_mode_cancels_fast_mode_timer() {
        let config = PeerPoolConfig {
            fast_mode_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (base, _, _) = base_with("cap=cap1", Limits::new(1, 2), &config);
        let mut period = base.attach_period();

        base.set_sync_mode(FAST);
        base.set_sync_mode(SLOW);
        assert!(!base.has_fast_mode_timer());
        assert_eq!(period.recv().await, Some(FAST));
        assert_eq!(period.recv().await, Some(SLOW));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(period.try_recv().is_err());
    }

    #[test]
    fn test_stop_search_timeout_is_set_once() {
        let pool = pool_with(Limits::new(1, 1));
        pool.base.state().max_cached_peers = 5;

        assert!(!pool.ready_to_stop_search());
        pool.set_stop_search_timeout(Duration::ZERO);
        let first = pool.base.state().stop_search_timeout;
        pool.set_stop_search_timeout(Duration::from_secs(60));
        assert_eq!(pool.base.state().stop_search_timeout, first);
        assert!(pool.ready_to_stop_search());
    }

    #[tokio::test]
    async fn test_start_search_requires_discovery() {
        let (base, discovery, _) = base_with("cap=cap1", Limits::new(1, 1), &test_config());
        let pool = Arc::new(StandardTopicPool::new(base));
        discovery.stop().await.unwrap();

        let server: Arc<dyn ConnectionManager> = Arc::new(server());
        assert_matches!(
            pool.clone().start_search(server),
            Err(PeerPoolError::DiscoveryNotRunning)
        );
        assert!(!pool.search_running());
        assert!(pool.is_stopped());
    }

    #[tokio::test]
    async fn test_search_lifecycle() {
        let (base, discovery, cache) = base_with("cap=cap1", Limits::new(1, 2), &test_config());
        let topic = base.topic().clone();
        let seed = random_node(40000);
        cache.add_peer(&seed, &topic).unwrap();

        let pool = Arc::new(StandardTopicPool::new(base));
        let mock = Arc::new(server());
        let server: Arc<dyn ConnectionManager> = mock.clone();

        pool.clone().start_search(server.clone()).unwrap();
        assert!(pool.search_running());
        assert!(!pool.is_stopped());
        // a second start is a no-op
        pool.clone().start_search(server.clone()).unwrap();

        assert!(wait_until(Duration::from_secs(1), || discovery.is_searching(&topic)).await);
        // cached peers are replayed into the search
        assert!(wait_until(Duration::from_secs(1), || mock.was_added(&seed.id)).await);

        let found = random_node(40001);
        assert!(discovery.emit(&topic, found.clone()).await);
        assert!(wait_until(Duration::from_secs(1), || mock.was_added(&found.id)).await);

        // the local node is never dialed
        let mut local = random_node(40002);
        local.id = mock.local_id();
        assert!(discovery.emit(&topic, local).await);

        pool.stop_search().await;
        assert!(!pool.search_running());
        assert!(pool.is_stopped());
        assert!(!discovery.is_searching(&topic));
        assert_eq!(discovery.periods(&topic), vec![FAST]);
        assert!(!mock.was_added(&mock.local_id()));

        // stopping twice is harmless
        pool.stop_search().await;
    }

    #[tokio::test]
    async fn test_restart_while_stopping_keeps_new_search() {
        let (base, discovery, _) = base_with("cap=cap1", Limits::new(1, 2), &test_config());
        let topic = base.topic().clone();
        let pool = Arc::new(StandardTopicPool::new(base));
        let mock = Arc::new(server());
        let server: Arc<dyn ConnectionManager> = mock.clone();

        pool.clone().start_search(server.clone()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || discovery.is_searching(&topic)).await);

        // leave the stop parked on its task joins
        let mut stop = pin!(pool.stop_search());
        let parked = poll_fn(|cx| Poll::Ready(stop.as_mut().poll(cx).is_pending())).await;
        assert!(parked);
        assert!(!pool.search_running());

        pool.clone().start_search(server.clone()).unwrap();
        stop.await;

        assert!(pool.search_running());
        assert!(!pool.is_stopped());
        pool.base.set_sync_mode(SLOW);
        assert!(
            wait_until(Duration::from_secs(1), || {
                discovery.is_searching(&topic) && discovery.periods(&topic).last() == Some(&SLOW)
            })
            .await
        );

        let found = random_node(40010);
        assert!(discovery.emit(&topic, found.clone()).await);
        assert!(wait_until(Duration::from_secs(1), || mock.was_added(&found.id)).await);

        pool.stop_search().await;
        assert!(!discovery.is_searching(&topic));
    }
}
