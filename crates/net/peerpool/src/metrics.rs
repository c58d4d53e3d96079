//! Topic pool metrics

use metrics::{Counter, Gauge};
use murmur_net_primitives::Topic;

/// Per-topic counters, labelled with the topic name.
#[derive(Clone, Debug)]
pub(crate) struct TopicMetrics {
    /// Nodes reported by discovery (cache seeds included)
    found_total: Counter,
    /// Peers the pool disconnected itself for exceeding `max`
    dismissed_total: Counter,
    /// Peers that disconnected on their own
    dropped_total: Counter,
    /// Currently connected peers
    connected: Gauge,
}

impl TopicMetrics {
    pub(crate) fn new(topic: &Topic) -> Self {
        let label = topic.to_string();
        Self {
            found_total: metrics::counter!("peerpool.topic.found_total", "topic" => label.clone()),
            dismissed_total: metrics::counter!(
                "peerpool.topic.dismissed_total",
                "topic" => label.clone()
            ),
            dropped_total: metrics::counter!("peerpool.topic.dropped_total", "topic" => label.clone()),
            connected: metrics::gauge!("peerpool.topic.connected", "topic" => label),
        }
    }

    pub(crate) fn inc_found(&self) {
        self.found_total.increment(1);
    }

    pub(crate) fn inc_dismissed(&self) {
        self.dismissed_total.increment(1);
    }

    pub(crate) fn inc_dropped(&self) {
        self.dropped_total.increment(1);
    }

    pub(crate) fn set_connected(&self, count: usize) {
        self.connected.set(count as f64);
    }
}
