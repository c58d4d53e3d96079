//! Max-heap of pending peers keyed by discovery time.
//!
//! Every entry's heap position is tracked in an index map so that refreshing
//! or removing a peer is O(log n). A peer absent from the index is not queued.

use std::collections::HashMap;

use murmur_net_primitives::NodeId;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: NodeId,
    discovered_at: Instant,
    /// Refresh order, breaks ties between equal timestamps.
    seq: u64,
}

impl Entry {
    fn key(&self) -> (Instant, u64) {
        (self.discovered_at, self.seq)
    }
}

/// Pending peers not yet handed to the connection manager, most recently
/// discovered first.
#[derive(Debug, Default)]
pub(crate) struct PeerQueue {
    heap: Vec<Entry>,
    positions: HashMap<NodeId, usize>,
    next_seq: u64,
}

impl PeerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn contains(&self, id: &NodeId) -> bool {
        self.positions.contains_key(id)
    }

    /// Queue `id`. An already queued id is refreshed instead.
    pub(crate) fn push(&mut self, id: NodeId, discovered_at: Instant) {
        if self.update(&id, discovered_at) {
            return;
        }
        let seq = self.bump_seq();
        let pos = self.heap.len();
        self.heap.push(Entry {
            id,
            discovered_at,
            seq,
        });
        self.positions.insert(id, pos);
        self.sift_up(pos);
    }

    /// Remove and return the most recently discovered peer.
    pub(crate) fn pop(&mut self) -> Option<NodeId> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(0, last);
        let entry = self.heap.pop()?;
        self.positions.remove(&entry.id);
        self.sift_down(0);
        Some(entry.id)
    }

    /// Set a new discovery time for a queued peer. Returns false if not queued.
    pub(crate) fn update(&mut self, id: &NodeId, discovered_at: Instant) -> bool {
        let Some(&pos) = self.positions.get(id) else {
            return false;
        };
        let seq = self.bump_seq();
        if let Some(entry) = self.heap.get_mut(pos) {
            entry.discovered_at = discovered_at;
            entry.seq = seq;
        }
        self.fix(pos);
        true
    }

    /// Returns false if `id` was not queued.
    pub(crate) fn remove(&mut self, id: &NodeId) -> bool {
        let Some(&pos) = self.positions.get(id) else {
            return false;
        };
        let last = self.heap.len() - 1;
        self.swap(pos, last);
        self.heap.pop();
        self.positions.remove(id);
        if pos < self.heap.len() {
            self.fix(pos);
        }
        true
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn fix(&mut self, pos: usize) {
        if !self.sift_up(pos) {
            self.sift_down(pos);
        }
    }

    /// Whether the entry at `a` should sit above the entry at `b`.
    fn higher(&self, a: usize, b: usize) -> bool {
        match (self.heap.get(a), self.heap.get(b)) {
            (Some(a), Some(b)) => a.key() > b.key(),
            _ => false,
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        for pos in [a, b] {
            if let Some(entry) = self.heap.get(pos) {
                self.positions.insert(entry.id, pos);
            }
        }
    }

    fn sift_up(&mut self, mut pos: usize) -> bool {
        let mut moved = false;
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.higher(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
            moved = true;
        }
        moved
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.higher(right, left) {
                right
            } else {
                left
            };
            if !self.higher(child, pos) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }

    /// Panics if the index map disagrees with the heap or the heap order is broken.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.positions.len(), self.heap.len());
        for (pos, entry) in self.heap.iter().enumerate() {
            assert_eq!(
                self.positions.get(&entry.id),
                Some(&pos),
                "stale index for {:?}",
                entry.id
            );
            if pos > 0 {
                assert!(!self.higher(pos, (pos - 1) / 2), "heap order broken at {pos}");
            }
        }
    }
}
