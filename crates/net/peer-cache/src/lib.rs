//! Per-topic cache of peers the node has connected to before.
//!
//! Entries are keyed by `(topic, node id)` so that range queries for one topic
//! never see another topic's peers. The cache survives restarts when backed by
//! [`RedbCacheStore`].

pub mod store;

use std::sync::Arc;

use murmur_net_primitives::{NODE_ID_LEN, Node, NodeId, Topic};
use thiserror::Error;
use tracing::warn;

#[cfg(feature = "redb")]
pub use store::RedbCacheStore;
pub use store::{CacheStore, MemoryCacheStore};

#[derive(Debug, Error)]
pub enum PeerCacheError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("topic name too long: {0} bytes")]
    TopicTooLong(usize),
}

/// Peer cache shared by all topic pools.
#[derive(Clone)]
pub struct PeerCache {
    store: Arc<dyn CacheStore>,
}

impl std::fmt::Debug for PeerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCache").finish_non_exhaustive()
    }
}

impl PeerCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Cache backed by an in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    /// Insert or refresh the record for `node` under `topic`.
    pub fn add_peer(&self, node: &Node, topic: &Topic) -> Result<(), PeerCacheError> {
        let key = peer_key(topic, &node.id)?;
        let value = postcard::to_allocvec(node)?;
        self.store.put(&key, &value)
    }

    pub fn remove_peer(&self, id: &NodeId, topic: &Topic) -> Result<(), PeerCacheError> {
        let key = peer_key(topic, id)?;
        self.store.delete(&key)
    }

    /// Up to `limit` cached records for `topic`, in node id order.
    ///
    /// Records that fail to decode are skipped.
    pub fn get_peers_range(
        &self,
        topic: &Topic,
        limit: usize,
    ) -> Result<Vec<Node>, PeerCacheError> {
        let prefix = topic_prefix(topic)?;
        let entries = self.store.scan_prefix(&prefix, limit)?;

        let mut nodes = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match postcard::from_bytes::<Node>(&value) {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    warn!(%topic, key = %hex::encode(&key), error = %e, "skipping corrupt cache entry")
                }
            }
        }
        Ok(nodes)
    }

    /// Number of cached records for `topic`, counting at most `limit`.
    pub fn count(&self, topic: &Topic, limit: usize) -> Result<usize, PeerCacheError> {
        let prefix = topic_prefix(topic)?;
        self.store.count_prefix(&prefix, limit)
    }
}

fn topic_prefix(topic: &Topic) -> Result<Vec<u8>, PeerCacheError> {
    let bytes = topic.as_bytes();
    let len =
        u16::try_from(bytes.len()).map_err(|_| PeerCacheError::TopicTooLong(bytes.len()))?;

    let mut prefix = Vec::with_capacity(2 + bytes.len() + NODE_ID_LEN);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(bytes);
    Ok(prefix)
}

fn peer_key(topic: &Topic, id: &NodeId) -> Result<Vec<u8>, PeerCacheError> {
    let mut key = topic_prefix(topic)?;
    key.extend_from_slice(id.as_bytes());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn node(n: u8) -> Node {
        Node::new(
            NodeId::new([n; 32]),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)),
            30303,
            30303,
        )
    }

    #[test]
    fn test_add_get_remove() {
        let cache = PeerCache::in_memory();
        let topic = Topic::from("whisper");

        cache.add_peer(&node(1), &topic).unwrap();
        cache.add_peer(&node(2), &topic).unwrap();
        // re-adding refreshes without duplicating
        cache.add_peer(&node(1), &topic).unwrap();

        let peers = cache.get_peers_range(&topic, 10).unwrap();
        assert_eq!(peers, vec![node(1), node(2)]);
        assert_eq!(cache.count(&topic, 10).unwrap(), 2);

        cache.remove_peer(&node(1).id, &topic).unwrap();
        assert_eq!(cache.get_peers_range(&topic, 10).unwrap(), vec![node(2)]);
    }

    #[test]
    fn test_range_respects_limit() {
        let cache = PeerCache::in_memory();
        let topic = Topic::from("whisper");
        for n in 0..5 {
            cache.add_peer(&node(n), &topic).unwrap();
        }

        assert_eq!(cache.get_peers_range(&topic, 3).unwrap().len(), 3);
        assert_eq!(cache.count(&topic, 2).unwrap(), 2);
        assert!(cache.get_peers_range(&topic, 0).unwrap().is_empty());
    }

    #[test]
    fn test_topics_are_isolated() {
        let cache = PeerCache::in_memory();
        let short = Topic::from("a");
        let long = Topic::from("ab");

        cache.add_peer(&node(1), &short).unwrap();
        cache.add_peer(&node(2), &long).unwrap();

        assert_eq!(cache.get_peers_range(&short, 10).unwrap(), vec![node(1)]);
        assert_eq!(cache.get_peers_range(&long, 10).unwrap(), vec![node(2)]);

        cache.remove_peer(&node(1).id, &long).unwrap();
        assert_eq!(cache.count(&short, 10).unwrap(), 1);
    }

    #[test]
    fn test_corrupt_entries_are_skipped() {
        let store = Arc::new(MemoryCacheStore::new());
        let cache = PeerCache::new(store.clone());
        let topic = Topic::from("whisper");

        cache.add_peer(&node(1), &topic).unwrap();
        let bad_key = peer_key(&topic, &NodeId::new([9; 32])).unwrap();
        store.put(&bad_key, &[0xff, 0xff]).unwrap();

        assert_eq!(cache.get_peers_range(&topic, 10).unwrap(), vec![node(1)]);
    }

    #[cfg(feature = "redb")]
    #[test]
    fn test_redb_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.redb");
        let topic = Topic::from("whisper");

        {
            let cache = PeerCache::new(Arc::new(RedbCacheStore::open(&path).unwrap()));
            cache.add_peer(&node(7), &topic).unwrap();
        }

        let cache = PeerCache::new(Arc::new(RedbCacheStore::open(&path).unwrap()));
        assert_eq!(cache.get_peers_range(&topic, 10).unwrap(), vec![node(7)]);
    }
}
