//! Peer pool: discovery lifecycle and per-topic orchestration.
//!
//! A single event loop reacts to connection events from the connection
//! manager, restarts discovery when a topic loses peers and stops it once
//! every topic is satisfied or the discovery timeout fires.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use murmur_net_peer_cache::PeerCache;
use murmur_net_primitives::{ConnectionManager, Discovery, NodeId, ServerPeerEvent, Topic};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DISCOVERY_RESTART_TIMEOUT, Limits, PeerPoolConfig, PoolSettings};
use crate::error::{PeerPoolError, PeerPoolResult};
use crate::events::{PoolEvent, PoolEventEmitter};
use crate::topic_pool::{NodeVerifier, PoolContext, TopicPool, new_topic_pool};

/// Manages discovery and one [`TopicPool`] per configured topic.
///
/// Build with [`PeerPool::new`], wrap in an [`Arc`] and [`start`](Self::start)
/// it once. The event loop keeps the pool alive until [`stop`](Self::stop).
pub struct PeerPool {
    discovery: Arc<dyn Discovery>,
    proxy: Option<Arc<dyn Discovery>>,
    verifier: Option<Arc<dyn NodeVerifier>>,
    cache: PeerCache,
    config: PeerPoolConfig,
    events: PoolEventEmitter,

    topics: Mutex<BTreeMap<Topic, Limits>>,
    pools: RwLock<Vec<Arc<dyn TopicPool>>>,
    server: Mutex<Option<Arc<dyn ConnectionManager>>>,

    /// Deadline after which discovery is stopped.
    disc_timeout: Mutex<Option<Instant>>,
    timeout_changed: Notify,

    started: AtomicBool,
    quit: Mutex<Option<oneshot::Sender<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerPool")
            .field("topics", &*self.topics.lock())
            .field("config", &self.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PeerPool {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        topics: BTreeMap<Topic, Limits>,
        cache: PeerCache,
        config: PeerPoolConfig,
    ) -> Self {
        Self {
            discovery,
            proxy: None,
            verifier: None,
            cache,
            config,
            events: PoolEventEmitter::default(),
            topics: Mutex::new(topics),
            pools: RwLock::new(Vec::new()),
            server: Mutex::new(None),
            disc_timeout: Mutex::new(None),
            timeout_changed: Notify::new(),
            started: AtomicBool::new(false),
            quit: Mutex::new(None),
            event_loop: Mutex::new(None),
        }
    }

    /// Pool for the topics and options of a loaded settings file.
    pub fn from_settings(
        discovery: Arc<dyn Discovery>,
        settings: PoolSettings,
        cache: PeerCache,
    ) -> Self {
        Self::new(discovery, settings.topics, cache, settings.options)
    }

    /// Discovery that receives the nodes found for `proxy:` topics.
    pub fn with_proxy(mut self, proxy: Arc<dyn Discovery>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Verifier consulted before caching peers of the mail server topic.
    pub fn with_verifier(mut self, verifier: Arc<dyn NodeVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &PeerPoolConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Configured topics with their current limits.
    pub fn topics(&self) -> BTreeMap<Topic, Limits> {
        self.topics.lock().clone()
    }

    /// Running pool for `topic`, once started.
    pub fn topic_pool(&self, topic: &Topic) -> Option<Arc<dyn TopicPool>> {
        self.pools
            .read()
            .iter()
            .find(|pool| pool.topic() == topic)
            .cloned()
    }

    fn pools(&self) -> Vec<Arc<dyn TopicPool>> {
        self.pools.read().clone()
    }

    /// Start the topic searches and the event loop.
    pub fn start(self: &Arc<Self>, server: Arc<dyn ConnectionManager>) -> PeerPoolResult<()> {
        if !self.discovery.running() {
            return Err(PeerPoolError::DiscoveryNotRunning);
        }
        if self.is_started() {
            return Err(PeerPoolError::AlreadyStarted);
        }

        let ctx = PoolContext {
            discovery: Arc::clone(&self.discovery),
            proxy: self.proxy.clone(),
            verifier: self.verifier.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
        };
        let pools = self
            .topics()
            .into_iter()
            .map(|(topic, limits)| new_topic_pool(topic, limits, &ctx))
            .collect::<PeerPoolResult<Vec<_>>>()?;

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PeerPoolError::AlreadyStarted);
        }

        // subscribe before any search can produce a connection
        let peer_events = server.subscribe();
        *self.server.lock() = Some(Arc::clone(&server));
        self.arm_discovery_timeout();

        *self.pools.write() = pools.clone();
        for pool in pools {
            let topic = pool.topic().clone();
            if let Err(e) = pool.start_search(Arc::clone(&server)) {
                error!(%topic, error = %e, "failed to start topic search");
            }
        }

        let (quit_tx, quit_rx) = oneshot::channel();
        *self.quit.lock() = Some(quit_tx);

        self.events.discovery_started();
        let handle = tokio::spawn(Arc::clone(self).run(quit_rx, peer_events, server));
        *self.event_loop.lock() = Some(handle);

        info!(topics = self.topics.lock().len(), "peer pool started");
        Ok(())
    }

    /// Stop the event loop and wait for it. Safe to call more than once.
    pub async fn stop(&self) {
        let Some(quit) = self.quit.lock().take() else {
            return;
        };
        let _ = quit.send(());

        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "peer pool event loop failed");
            }
        }
        info!("peer pool stopped");
    }

    /// Replace the limits of a configured topic.
    pub fn update_topic(&self, topic: &Topic, limits: Limits) -> PeerPoolResult<()> {
        {
            let mut topics = self.topics.lock();
            let entry = topics
                .get_mut(topic)
                .ok_or_else(|| PeerPoolError::TopicNotFound(topic.clone()))?;
            *entry = limits;
        }
        if let Some(pool) = self.topic_pool(topic) {
            pool.set_limits(limits);
        }
        debug!(%topic, min = limits.min, max = limits.max, "topic limits updated");
        Ok(())
    }

    /// Start discovery if needed and resume searches of topics below their
    /// minimum. Does nothing to the searches before [`start`](Self::start).
    pub async fn restart_discovery(&self) -> PeerPoolResult<()> {
        let server = self.server.lock().clone();
        match server {
            Some(server) => self.restart_discovery_with(&server).await,
            None => self.start_discovery().await,
        }
    }

    async fn restart_discovery_with(
        &self,
        server: &Arc<dyn ConnectionManager>,
    ) -> PeerPoolResult<()> {
        self.start_discovery().await?;

        for pool in self.pools() {
            if !pool.below_min() || pool.search_running() {
                continue;
            }
            let topic = pool.topic().clone();
            if let Err(e) = pool.start_search(Arc::clone(server)) {
                error!(%topic, error = %e, "failed to restart topic search");
            }
        }
        Ok(())
    }

    async fn start_discovery(&self) -> PeerPoolResult<()> {
        if self.discovery.running() {
            return Ok(());
        }
        self.discovery.start().await?;
        debug!("discovery restarted");
        self.arm_discovery_timeout();
        self.events.discovery_started();
        Ok(())
    }

    async fn stop_discovery(&self) {
        if !self.discovery.running() {
            return;
        }
        if let Err(e) = self.discovery.stop().await {
            error!(error = %e, "failed to stop discovery");
        }
        for pool in self.pools() {
            pool.stop_search().await;
        }
        *self.disc_timeout.lock() = None;
        debug!("discovery stopped");
        self.events.discovery_stopped();
    }

    fn arm_discovery_timeout(&self) {
        if !self.config.allow_stop || self.config.disc_server_timeout.is_zero() {
            return;
        }
        *self.disc_timeout.lock() = Some(Instant::now() + self.config.disc_server_timeout);
        self.timeout_changed.notify_one();
    }

    async fn run(
        self: Arc<Self>,
        mut quit: oneshot::Receiver<()>,
        mut peer_events: broadcast::Receiver<ServerPeerEvent>,
        server: Arc<dyn ConnectionManager>,
    ) {
        let mut retry_at: Option<Instant> = None;
        let mut stop_at: Option<Instant> = None;
        let mut events_open = true;

        loop {
            let disc_timeout = *self.disc_timeout.lock();

            tokio::select! {
                biased;

                _ = &mut quit => break,

                _ = self.timeout_changed.notified() => {}

                _ = sleep_until_opt(disc_timeout) => {
                    info!("discovery timed out");
                    *self.disc_timeout.lock() = None;
                    self.stop_discovery().await;
                }

                _ = sleep_until_opt(retry_at) => {
                    retry_at = None;
                    if let Err(e) = self.restart_discovery_with(&server).await {
                        error!(error = %e, "failed to restart discovery");
                        retry_at = Some(Instant::now() + DISCOVERY_RESTART_TIMEOUT);
                    }
                }

                _ = sleep_until_opt(stop_at) => {
                    stop_at = None;
                    self.stop_satisfied_topics().await;
                }

                event = peer_events.recv(), if events_open => match event {
                    Ok(ServerPeerEvent::Dropped(id)) => {
                        if self.handle_dropped_peer(&*server, &id) {
                            retry_at = Some(Instant::now());
                        }
                        self.events.discovery_summary(server.peers_info());
                    }
                    Ok(ServerPeerEvent::Added(id)) => {
                        self.handle_added_peer(&*server, &id);
                        if self.config.allow_stop {
                            stop_at = Some(Instant::now() + self.config.topic_stop_search_delay);
                        }
                        self.events.discovery_summary(server.peers_info());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "peer event subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("peer event subscription closed");
                        events_open = false;
                    }
                },
            }
        }

        self.stop_discovery().await;
        for pool in self.pools() {
            pool.stop_search().await;
        }
        debug!("peer pool event loop exited");
    }

    /// Returns true if any topic lost a peer it did not ask to drop.
    fn handle_dropped_peer(&self, server: &dyn ConnectionManager, id: &NodeId) -> bool {
        let mut gap = false;
        for pool in self.pools() {
            if !pool.confirm_dropped(server, id) {
                continue;
            }
            gap = true;
            if let Some(node) = pool.add_peer_from_table(server) {
                trace!(topic = %pool.topic(), id = %node.id, "replacing dropped peer");
            }
        }
        gap
    }

    fn handle_added_peer(&self, server: &dyn ConnectionManager, id: &NodeId) {
        for pool in self.pools() {
            pool.confirm_added(server, id);
            if self.config.allow_stop && pool.max_reached() {
                pool.set_stop_search_timeout(self.config.topic_stop_search_delay);
            }
        }
    }

    async fn stop_satisfied_topics(&self) {
        if !self.config.allow_stop {
            return;
        }
        let pools = self.pools();
        for pool in &pools {
            if pool.ready_to_stop_search() {
                debug!(topic = %pool.topic(), "topic satisfied, stopping search");
                pool.stop_search().await;
            }
        }
        if pools.iter().all(|pool| pool.is_stopped()) {
            debug!("all topics stopped");
            self.stop_discovery().await;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
