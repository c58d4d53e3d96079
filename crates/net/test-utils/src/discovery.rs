//! In-process discovery that records searches and lets tests inject found nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use murmur_net_primitives::{
    Discovery, DiscoveryError, FoundSender, LookupSender, Node, PeriodReceiver, Topic,
};
use parking_lot::Mutex;

/// Discovery double.
///
/// `discover` keeps the found sender of every active search so tests can feed
/// nodes with [`MockDiscovery::emit`], and records each lookup period it
/// receives until the period channel closes.
#[derive(Debug, Default)]
pub struct MockDiscovery {
    running: AtomicBool,
    fail_start: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    searches: Mutex<HashMap<Topic, FoundSender>>,
    periods: Mutex<HashMap<Topic, Vec<Duration>>>,
    inserted: Mutex<HashMap<Topic, Vec<Node>>>,
}

impl MockDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// A discovery that is already running.
    pub fn started() -> Self {
        let discovery = Self::default();
        discovery.running.store(true, Ordering::SeqCst);
        discovery
    }

    /// Make subsequent `start` calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Whether a search for `topic` is currently inside `discover`.
    pub fn is_searching(&self, topic: &Topic) -> bool {
        self.searches.lock().contains_key(topic)
    }

    /// Deliver `node` to the active search for `topic`.
    ///
    /// Returns false when no search is running for the topic.
    pub async fn emit(&self, topic: &Topic, node: Node) -> bool {
        let sender = self.searches.lock().get(topic).cloned();
        match sender {
            Some(sender) => sender.send(node).await.is_ok(),
            None => false,
        }
    }

    /// Lookup periods received by searches for `topic`, in order.
    pub fn periods(&self, topic: &Topic) -> Vec<Duration> {
        self.periods.lock().get(topic).cloned().unwrap_or_default()
    }

    /// Nodes passed to `insert_nodes` for `topic`, in order.
    pub fn inserted(&self, topic: &Topic) -> Vec<Node> {
        self.inserted.lock().get(topic).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<(), DiscoveryError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Start("mock start failure".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn discover(
        &self,
        topic: Topic,
        mut period: PeriodReceiver,
        found: FoundSender,
        _lookup: LookupSender,
    ) -> Result<(), DiscoveryError> {
        self.searches.lock().insert(topic.clone(), found.clone());

        while let Some(interval) = period.recv().await {
            self.periods
                .lock()
                .entry(topic.clone())
                .or_default()
                .push(interval);
        }

        // a newer search for the topic may already have replaced this one
        let mut searches = self.searches.lock();
        if searches.get(&topic).is_some_and(|s| s.same_channel(&found)) {
            searches.remove(&topic);
        }
        Ok(())
    }

    fn insert_nodes(&self, topic: &Topic, nodes: Vec<Node>) -> Result<(), DiscoveryError> {
        self.inserted
            .lock()
            .entry(topic.clone())
            .or_default()
            .extend(nodes);
        Ok(())
    }
}
