//! Test utilities and mocks for murmur-net crates.

mod discovery;
mod server;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use murmur_net_primitives::{Node, NodeId};

pub use discovery::MockDiscovery;
pub use server::MockConnectionManager;

/// Node with a random id listening on localhost.
pub fn random_node(port: u16) -> Node {
    Node::new(
        NodeId::new(rand::random()),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        port,
    )
}

/// `count` random nodes on consecutive ports starting at `base_port`.
pub fn random_nodes(count: usize, base_port: u16) -> Vec<Node> {
    (0..count)
        .map(|i| random_node(base_port.wrapping_add(i as u16)))
        .collect()
}

/// Install a test-writer subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `fut` for at most `timeout`.
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(timeout, fut).await.ok()
}
