//! Retransmit-limited broadcast queues.
//!
//! Every queued change is handed to the gossip layer a bounded number of
//! times, scaled by `log10` of the cluster size. A newer change for the same
//! key whose content covers an older queued change replaces it, so a burst
//! of updates to one key does not pile up in the queue.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

/// Number of times each broadcast is transmitted before it leaves the queue.
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let node_scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    (retransmit_mult * node_scale).max(1)
}

#[derive(Debug, Clone)]
struct QueuedBroadcast {
    key: String,
    content: Vec<String>,
    version: u64,
    msg: Vec<u8>,
    transmits: usize,
    id: u64,
}

impl QueuedBroadcast {
    /// True if `self` makes `old` redundant.
    fn invalidates(&self, old: &QueuedBroadcast) -> bool {
        self.key == old.key
            && self.version > old.version
            && old.content.iter().all(|c| self.content.contains(c))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<QueuedBroadcast>,
    next_id: u64,
}

#[derive(Debug)]
pub struct BroadcastQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    num_nodes: Arc<AtomicUsize>,
    retransmit_mult: usize,
    max_len: usize,
}

impl BroadcastQueue {
    pub fn new(
        name: &'static str,
        num_nodes: Arc<AtomicUsize>,
        retransmit_mult: usize,
        max_len: usize,
    ) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState::default()),
            num_nodes,
            retransmit_mult,
            max_len,
        }
    }

    /// Queues a broadcast. Returns the number of queued broadcasts dropped
    /// to respect the length limit.
    pub fn queue(&self, key: String, content: Vec<String>, version: u64, msg: Vec<u8>) -> usize {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let broadcast = QueuedBroadcast {
            key,
            content,
            version,
            msg,
            transmits: 0,
            id,
        };
        let before = state.items.len();
        state.items.retain(|old| !broadcast.invalidates(old));
        let invalidated = before - state.items.len();
        if invalidated > 0 {
            debug!(
                queue = self.name,
                key = %broadcast.key,
                invalidated,
                "Queued broadcast replaced older ones"
            );
        }
        state.items.push(broadcast);

        let mut dropped = 0;
        if self.max_len > 0 && state.items.len() > self.max_len {
            // Keep the least transmitted, newest broadcasts.
            state
                .items
                .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));
            dropped = state.items.len() - self.max_len;
            state.items.truncate(self.max_len);
        }
        dropped
    }

    /// Returns queued messages fitting in `limit` bytes, each costing
    /// `overhead + len`. Fewest-transmitted messages go first.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut state = self.state.lock();
        if state.items.is_empty() {
            return Vec::new();
        }

        let max_transmits = retransmit_limit(
            self.retransmit_mult,
            self.num_nodes.load(Ordering::Relaxed),
        );
        state
            .items
            .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));

        let mut used = 0;
        let mut out = Vec::new();
        for item in state.items.iter_mut() {
            let cost = overhead + item.msg.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            item.transmits += 1;
            out.push(item.msg.clone());
        }
        state.items.retain(|item| item.transmits < max_transmits);
        out
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(num_nodes: usize, max_len: usize) -> BroadcastQueue {
        BroadcastQueue::new("test", Arc::new(AtomicUsize::new(num_nodes)), 1, max_len)
    }

    fn content(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_retransmit_limit_scales_with_log10() {
        assert_eq!(retransmit_limit(4, 0), 1);
        assert_eq!(retransmit_limit(4, 1), 4);
        assert_eq!(retransmit_limit(4, 9), 4);
        assert_eq!(retransmit_limit(4, 10), 8);
        assert_eq!(retransmit_limit(4, 100), 12);
    }

    #[test]
    fn test_newer_superset_invalidates_older() {
        let q = queue(1, 0);
        q.queue("k".into(), content(&["a"]), 1, b"v1".to_vec());
        q.queue("k".into(), content(&["a", "b"]), 2, b"v2".to_vec());
        assert_eq!(q.len(), 1);
        assert_eq!(q.get_broadcasts(0, 1024), vec![b"v2".to_vec()]);
    }

    #[test]
    fn test_disjoint_content_or_other_key_is_kept() {
        let q = queue(1, 0);
        q.queue("k".into(), content(&["a"]), 1, b"v1".to_vec());
        q.queue("k".into(), content(&["b"]), 2, b"v2".to_vec());
        q.queue("j".into(), content(&["a", "b"]), 3, b"v3".to_vec());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_older_version_does_not_invalidate() {
        let q = queue(1, 0);
        q.queue("k".into(), content(&["a"]), 5, b"v5".to_vec());
        q.queue("k".into(), content(&["a"]), 4, b"v4".to_vec());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_byte_budget_respected() {
        let q = queue(1, 0);
        q.queue("a".into(), content(&["a"]), 1, vec![0; 10]);
        q.queue("b".into(), content(&["b"]), 1, vec![0; 10]);
        let out = q.get_broadcasts(2, 15);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_broadcast_removed_after_retransmit_limit() {
        // one node, mult 1 -> one transmit each
        let q = queue(1, 0);
        q.queue("a".into(), content(&["a"]), 1, b"x".to_vec());
        assert_eq!(q.get_broadcasts(0, 100).len(), 1);
        assert!(q.is_empty());
        assert!(q.get_broadcasts(0, 100).is_empty());
    }

    #[test]
    fn test_least_transmitted_first() {
        let q = BroadcastQueue::new("test", Arc::new(AtomicUsize::new(100)), 2, 0);
        q.queue("a".into(), content(&["a"]), 1, b"a".to_vec());
        assert_eq!(q.get_broadcasts(0, 100), vec![b"a".to_vec()]);
        q.queue("b".into(), content(&["b"]), 1, b"b".to_vec());
        // "b" has never been sent, so it wins the single-message budget
        assert_eq!(q.get_broadcasts(0, 1), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_overflow_drops_most_transmitted() {
        let q = BroadcastQueue::new("test", Arc::new(AtomicUsize::new(100)), 4, 2);
        q.queue("a".into(), content(&["a"]), 1, b"a".to_vec());
        q.get_broadcasts(0, 100);
        q.queue("b".into(), content(&["b"]), 1, b"b".to_vec());
        let dropped = q.queue("c".into(), content(&["c"]), 1, b"c".to_vec());
        assert_eq!(dropped, 1);
        let mut out = q.get_broadcasts(0, 100);
        out.sort();
        assert_eq!(out, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
