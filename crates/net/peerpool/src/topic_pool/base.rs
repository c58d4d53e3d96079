//! Peer bookkeeping and search lifecycle shared by every topic pool variant.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use murmur_net_peer_cache::PeerCache;
use murmur_net_primitives::{ConnectionManager, Discovery, Node, NodeId, PeriodSender, Topic};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::config::{EXPIRATION_PERIOD, Limits, PeerPoolConfig};
use crate::error::{PeerPoolError, PeerPoolResult};
use crate::metrics::TopicMetrics;
use crate::peer::PeerInfo;
use crate::queue::PeerQueue;

/// Cached peers seeded into a new search, and the found channel capacity.
pub(crate) const FOUND_CHANNEL_CAPACITY: usize = 5;
pub(crate) const LOOKUP_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncModes {
    pub(crate) fast: Duration,
    pub(crate) slow: Duration,
    pub(crate) fast_timeout: Duration,
}

#[derive(Debug)]
struct FastModeTimer {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Mutable topic state, guarded by a single lock.
///
/// A node id is never in both `pending` and `connected`; every queued id is
/// in `pending`.
#[derive(Debug)]
pub(crate) struct TopicState {
    pub(crate) limits: Limits,
    pub(crate) max_cached_peers: usize,
    pub(crate) pending: HashMap<NodeId, PeerInfo>,
    pub(crate) queue: PeerQueue,
    pub(crate) connected: HashMap<NodeId, PeerInfo>,
    /// `None` while the search is stopped.
    pub(crate) current_mode: Option<Duration>,
    period: Option<PeriodSender>,
    fast_mode_timer: Option<FastModeTimer>,
    pub(crate) stop_search_timeout: Option<Instant>,
}

impl TopicState {
    fn new(limits: Limits, multiplier: usize) -> Self {
        Self {
            limits,
            max_cached_peers: limits.max.saturating_mul(multiplier),
            pending: HashMap::new(),
            queue: PeerQueue::new(),
            connected: HashMap::new(),
            current_mode: None,
            period: None,
            fast_mode_timer: None,
            stop_search_timeout: None,
        }
    }

    fn add_to_pending(&mut self, peer: PeerInfo) {
        self.pending.entry(peer.id()).or_insert(peer);
    }

    /// Queue a pending peer. Ids that are not pending are ignored.
    fn add_to_queue(&mut self, id: &NodeId) {
        if let Some(peer) = self.pending.get(id) {
            self.queue.push(*id, peer.discovered_at);
        }
    }

    pub(crate) fn remove_from_pending(&mut self, id: &NodeId) -> Option<PeerInfo> {
        let peer = self.pending.remove(id)?;
        self.queue.remove(id);
        Some(peer)
    }

    fn update_pending(&mut self, id: &NodeId, now: Instant) -> bool {
        let Some(peer) = self.pending.get_mut(id) else {
            return false;
        };
        peer.discovered_at = now;
        self.queue.update(id, now);
        true
    }

    fn move_to_connected(&mut self, id: &NodeId) {
        if let Some(peer) = self.remove_from_pending(id) {
            self.connected.insert(*id, peer);
        }
    }

    fn take_fast_mode_timer(&mut self) -> Option<JoinHandle<()>> {
        let timer = self.fast_mode_timer.take()?;
        let _ = timer.cancel.send(());
        Some(timer.task)
    }
}

fn update_sync_mode(shared: &Arc<Mutex<TopicState>>, state: &mut TopicState, modes: SyncModes) {
    let mode = if state.connected.len() < state.limits.min {
        modes.fast
    } else {
        modes.slow
    };
    set_sync_mode(shared, state, modes, mode);
}

/// Publish `mode` to the running search. Re-selecting the current mode is a
/// no-op. Fast mode arms the revert timer, slow mode cancels it.
fn set_sync_mode(
    shared: &Arc<Mutex<TopicState>>,
    state: &mut TopicState,
    modes: SyncModes,
    mode: Duration,
) {
    if state.current_mode == Some(mode) {
        return;
    }

    if let Some(period) = &state.period {
        let _ = period.send(mode);
    }
    state.current_mode = Some(mode);

    if mode == modes.fast && state.fast_mode_timer.is_none() {
        state.fast_mode_timer = limit_fast_mode(shared, modes);
    }
    if mode == modes.slow {
        // the timer task exits on its own once cancelled
        drop(state.take_fast_mode_timer());
    }
}

fn limit_fast_mode(shared: &Arc<Mutex<TopicState>>, modes: SyncModes) -> Option<FastModeTimer> {
    if modes.fast_timeout.is_zero() {
        return None;
    }
    let runtime = tokio::runtime::Handle::try_current().ok()?;

    let (cancel, mut cancelled) = oneshot::channel();
    let state = Arc::downgrade(shared);
    let task = runtime.spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(modes.fast_timeout) => {}
            _ = &mut cancelled => return,
        }

        let Some(shared) = state.upgrade() else {
            return;
        };
        let mut state = shared.lock();
        // cancelled while waiting for the lock
        if !matches!(
            cancelled.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ) {
            return;
        }
        trace!("fast mode timed out");
        set_sync_mode(&shared, &mut state, modes, modes.slow);
    });

    Some(FastModeTimer { cancel, task })
}

struct SearchHandle {
    quit: oneshot::Sender<()>,
    handler: JoinHandle<()>,
    discover: JoinHandle<()>,
}

/// State and search machinery shared by topic pool variants.
pub struct TopicPoolBase {
    topic: Topic,
    discovery: Arc<dyn Discovery>,
    cache: PeerCache,
    modes: SyncModes,
    multiplier: usize,
    state: Arc<Mutex<TopicState>>,
    running: AtomicBool,
    search: Mutex<Option<SearchHandle>>,
    metrics: TopicMetrics,
}

impl fmt::Debug for TopicPoolBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicPoolBase")
            .field("topic", &self.topic)
            .field("running", &self.search_running())
            .finish_non_exhaustive()
    }
}

impl TopicPoolBase {
    pub fn new(
        topic: Topic,
        limits: Limits,
        discovery: Arc<dyn Discovery>,
        cache: PeerCache,
        config: &PeerPoolConfig,
    ) -> Self {
        let multiplier = config.max_cached_peers_multiplier;
        Self {
            metrics: TopicMetrics::new(&topic),
            topic,
            discovery,
            cache,
            modes: SyncModes {
                fast: config.fast_sync,
                slow: config.slow_sync,
                fast_timeout: config.fast_mode_timeout,
            },
            multiplier,
            state: Arc::new(Mutex::new(TopicState::new(limits, multiplier))),
            running: AtomicBool::new(false),
            search: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub(crate) fn cache(&self) -> &PeerCache {
        &self.cache
    }

    pub(crate) fn metrics(&self) -> &TopicMetrics {
        &self.metrics
    }

    pub fn limits(&self) -> Limits {
        self.state.lock().limits
    }

    /// Replace the limits; the cached-peer bound follows `max`.
    pub fn set_limits(&self, limits: Limits) {
        let mut state = self.state.lock();
        state.limits = limits;
        state.max_cached_peers = limits.max.saturating_mul(self.multiplier);
    }

    pub fn search_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().current_mode.is_none()
    }

    pub fn below_min(&self) -> bool {
        let state = self.state.lock();
        state.connected.len() < state.limits.min
    }

    /// Exactly `max` peers are connected.
    pub fn max_reached(&self) -> bool {
        let state = self.state.lock();
        state.connected.len() == state.limits.max
    }

    pub fn connected_peers(&self) -> Vec<Node> {
        self.state
            .lock()
            .connected
            .values()
            .map(|peer| peer.node.clone())
            .collect()
    }

    /// The cache already holds the maximum number of peers for this topic.
    pub fn max_cached_peers_reached(&self) -> bool {
        let max_cached = self.state.lock().max_cached_peers;
        if max_cached == 0 {
            return true;
        }
        match self.cache.count(&self.topic, max_cached) {
            Ok(count) => count >= max_cached,
            Err(e) => {
                error!(topic = %self.topic, error = %e, "failed to count cached peers");
                false
            }
        }
    }

    /// Arm the stop-search deadline unless one is already set.
    pub fn set_stop_search_timeout(&self, delay: Duration) {
        let mut state = self.state.lock();
        if state.stop_search_timeout.is_none() {
            state.stop_search_timeout = Some(Instant::now() + delay);
        }
    }

    fn stop_search_delay_expired(&self) -> bool {
        self.state
            .lock()
            .stop_search_timeout
            .is_some_and(|deadline| deadline <= Instant::now())
    }

    pub fn ready_to_stop_search(&self) -> bool {
        self.stop_search_delay_expired() || self.max_cached_peers_reached()
    }

    /// Node record of a pending peer.
    pub(crate) fn pending_node(&self, id: &NodeId) -> Option<Node> {
        self.state.lock().pending.get(id).map(|peer| peer.node.clone())
    }

    /// Drop a pending peer entirely and ask the connection manager to remove it.
    pub(crate) fn forget_peer(&self, server: &dyn ConnectionManager, id: &NodeId) {
        let peer = self.state.lock().remove_from_pending(id);
        if let Some(peer) = peer {
            server.remove_peer(&peer.node);
        }
    }

    /// Forget a connected peer and ask the connection manager to drop it.
    pub(crate) fn release_peer(&self, server: &dyn ConnectionManager, id: &NodeId) {
        let mut state = self.state.lock();
        let Some(peer) = state.connected.remove(id) else {
            return;
        };
        self.metrics.set_connected(state.connected.len());
        // dismissed peers were already handed back to the connection manager
        if !peer.dismissed {
            server.remove_peer(&peer.node);
        }
        if self.search_running() {
            update_sync_mode(&self.state, &mut state, self.modes);
        }
    }

    /// Record a discovered node and connect to it while below the cached-peer
    /// bound; otherwise queue it.
    pub fn process_found_node(&self, server: &dyn ConnectionManager, node: Node) {
        let id = node.id;
        debug!(topic = %self.topic, %id, "peer found");
        self.metrics.inc_found();

        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(peer) = state.connected.get_mut(&id) {
            peer.discovered_at = now;
            return;
        }

        if !state.update_pending(&id, now) {
            state.add_to_pending(PeerInfo::new(node, now));
        }

        if state.connected.len() < state.max_cached_peers {
            if let Some(peer) = state.pending.get(&id) {
                server.add_peer(&peer.node);
            }
        } else {
            state.add_to_queue(&id);
        }
    }

    /// Handle a connection confirmed by the connection manager.
    ///
    /// Returns the node when `id` was pending for this topic. The peer is
    /// cached in any case and dismissed again if it overflows `max`.
    pub fn confirm_added(&self, server: &dyn ConnectionManager, id: &NodeId) -> Option<Node> {
        let mut state = self.state.lock();

        // inbound or owned by another topic
        let node = state.pending.get(id)?.node.clone();

        if let Err(e) = self.cache.add_peer(&node, &self.topic) {
            error!(topic = %self.topic, %id, error = %e, "failed to persist a peer");
        }

        state.move_to_connected(id);
        self.metrics.set_connected(state.connected.len());

        if state.connected.len() > state.limits.max {
            debug!(topic = %self.topic, %id, "max limit reached, dismissing peer");
            if let Some(peer) = state.connected.get_mut(id) {
                peer.dismissed = true;
            }
            self.metrics.inc_dismissed();
            server.remove_peer(&node);
            return Some(node);
        }

        if let Some(peer) = state.connected.get_mut(id) {
            peer.dismissed = false;
        }

        if self.search_running() {
            update_sync_mode(&self.state, &mut state, self.modes);
        }
        Some(node)
    }

    /// Handle a closed connection.
    ///
    /// Returns true when a peer that left on its own was removed, leaving a
    /// gap to fill. Peers the pool dismissed go back to the queue instead.
    pub fn confirm_dropped(&self, server: &dyn ConnectionManager, id: &NodeId) -> bool {
        let mut state = self.state.lock();

        let Some(peer) = state.connected.remove(id) else {
            return false;
        };
        self.metrics.set_connected(state.connected.len());
        debug!(topic = %self.topic, %id, dismissed = peer.dismissed, "peer dropped");

        if peer.dismissed {
            state.add_to_pending(peer);
            state.add_to_queue(id);
            return false;
        }

        self.metrics.inc_dropped();
        // a network error leaves the peer in the static set
        server.remove_peer(&peer.node);

        if let Err(e) = self.cache.remove_peer(id, &self.topic) {
            error!(topic = %self.topic, %id, error = %e, "failed to remove peer from cache");
        }

        if self.search_running() {
            update_sync_mode(&self.state, &mut state, self.modes);
        }
        true
    }

    /// Dial the most recently discovered queued peer if it has not expired.
    pub fn add_peer_from_table(&self, server: &dyn ConnectionManager) -> Option<Node> {
        let mut state = self.state.lock();
        let id = state.queue.pop()?;
        let peer = state.pending.get(&id)?;

        if peer.discovered_at.elapsed() < EXPIRATION_PERIOD {
            server.add_peer(&peer.node);
            return Some(peer.node.clone());
        }
        None
    }

    /// Start searching the topic; found nodes are handed to `on_found`.
    ///
    /// Starting an already running search is a no-op.
    pub(crate) fn start_search<F>(
        &self,
        server: &dyn ConnectionManager,
        on_found: F,
    ) -> PeerPoolResult<()>
    where
        F: Fn(Node) + Send + 'static,
    {
        if self.search_running() {
            return Ok(());
        }
        if !self.discovery.running() {
            return Err(PeerPoolError::DiscoveryNotRunning);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (period_tx, period_rx) = mpsc::unbounded_channel();
        let (found_tx, found_rx) = mpsc::channel(FOUND_CHANNEL_CAPACITY);
        let (lookup_tx, lookup_rx) = mpsc::channel(LOOKUP_CHANNEL_CAPACITY);
        let (quit_tx, quit_rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            state.stop_search_timeout = None;
            state.period = Some(period_tx);
            set_sync_mode(&self.state, &mut state, self.modes, self.modes.fast);
        }

        match self.cache.get_peers_range(&self.topic, FOUND_CHANNEL_CAPACITY) {
            Ok(peers) => {
                for peer in peers {
                    debug!(topic = %self.topic, id = %peer.id, "adding a peer from cache");
                    let _ = found_tx.try_send(peer);
                }
            }
            Err(e) => error!(topic = %self.topic, error = %e, "failed to read cached peers"),
        }

        let discovery = Arc::clone(&self.discovery);
        let topic = self.topic.clone();
        let discover = tokio::spawn(async move {
            if let Err(e) = discovery
                .discover(topic.clone(), period_rx, found_tx, lookup_tx)
                .await
            {
                error!(%topic, error = %e, "topic search failed");
            }
        });
        let handler = tokio::spawn(handle_found_peers(
            quit_rx,
            found_rx,
            lookup_rx,
            server.local_id(),
            on_found,
        ));

        debug!(topic = %self.topic, "search started");
        *self.search.lock() = Some(SearchHandle {
            quit: quit_tx,
            handler,
            discover,
        });
        Ok(())
    }

    /// Stop the search and wait for its tasks. Idempotent.
    pub async fn stop_search(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let Some(search) = self.search.lock().take() else {
            return;
        };
        debug!(topic = %self.topic, "stopping search");

        let _ = search.quit.send(());
        // a search started while this one is being joined owns the new sender
        let (timer, period) = {
            let mut state = self.state.lock();
            state.current_mode = None;
            (state.take_fast_mode_timer(), state.period.take())
        };

        let _ = search.handler.await;
        if let Some(timer) = timer {
            let _ = timer.await;
        }

        // closing the period channel ends the discovery task
        drop(period);
        let _ = search.discover.await;
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> parking_lot::MutexGuard<'_, TopicState> {
        self.state.lock()
    }

    /// Mark the search running with a period channel the test can observe.
    #[cfg(test)]
    pub(crate) fn attach_period(&self) -> mpsc::UnboundedReceiver<Duration> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.running.store(true, Ordering::SeqCst);
        self.state.lock().period = Some(tx);
        rx
    }

    #[cfg(test)]
    pub(crate) fn set_sync_mode(&self, mode: Duration) {
        let mut state = self.state.lock();
        set_sync_mode(&self.state, &mut state, self.modes, mode);
    }

    #[cfg(test)]
    pub(crate) fn modes(&self) -> SyncModes {
        self.modes
    }

    #[cfg(test)]
    pub(crate) fn has_fast_mode_timer(&self) -> bool {
        self.state.lock().fast_mode_timer.is_some()
    }
}

async fn handle_found_peers<F>(
    mut quit: oneshot::Receiver<()>,
    mut found: mpsc::Receiver<Node>,
    mut lookup: mpsc::Receiver<bool>,
    local_id: NodeId,
    on_found: F,
) where
    F: Fn(Node),
{
    let mut lookup_open = true;
    loop {
        tokio::select! {
            biased;
            _ = &mut quit => return,
            res = lookup.recv(), if lookup_open => {
                if res.is_none() {
                    lookup_open = false;
                }
            }
            node = found.recv() => match node {
                Some(node) if node.id == local_id => {}
                Some(node) => on_found(node),
                None => return,
            },
        }
    }
}
