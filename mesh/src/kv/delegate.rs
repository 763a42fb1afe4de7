use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use prost::Message as _;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use super::Kv;
use crate::{
    history::Message,
    membership::Delegate,
    metrics::set_cluster_size,
    wire::{frames, put_frame, time_to_millis, KeyValuePair},
};

/// Queue depth of each per-key worker.
const KEY_WORKER_QUEUE_SIZE: usize = 1024;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle of the task applying remote updates for one key.
#[derive(Debug)]
pub(super) struct KeyWorker {
    id: u64,
    tx: mpsc::Sender<KeyValuePair>,
}

impl Kv {
    /// Hands this store to the membership engine.
    pub fn attach(self: &Arc<Self>) -> KvDelegate {
        KvDelegate { kv: self.clone() }
    }

    /// Queues a remote update on the worker for its key, spawning the
    /// worker if needed. Updates of one key apply in arrival order.
    fn enqueue_remote_update(self: &Arc<Self>, pair: KeyValuePair) {
        match self.key_workers.entry(pair.key.clone()) {
            Entry::Occupied(mut entry) => match entry.get().tx.try_send(pair) {
                Ok(()) => {}
                Err(TrySendError::Full(pair)) => {
                    self.metrics.dropped_messages(1);
                    warn!(key = %pair.key, "Per-key update queue is full, dropping message");
                }
                Err(TrySendError::Closed(pair)) => {
                    // worker exited without unregistering, e.g. after a panic
                    let (worker, rx) = self.new_worker();
                    let key = pair.key.clone();
                    let _ = worker.tx.try_send(pair);
                    let id = worker.id;
                    entry.insert(worker);
                    self.spawn_worker(key, id, rx);
                }
            },
            Entry::Vacant(entry) => {
                let key = pair.key.clone();
                let (worker, rx) = self.new_worker();
                let _ = worker.tx.try_send(pair);
                let id = worker.id;
                entry.insert(worker);
                self.spawn_worker(key, id, rx);
            }
        }
    }

    fn new_worker(&self) -> (KeyWorker, mpsc::Receiver<KeyValuePair>) {
        let (tx, rx) = mpsc::channel(KEY_WORKER_QUEUE_SIZE);
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        (KeyWorker { id, tx }, rx)
    }

    fn spawn_worker(self: &Arc<Self>, key: String, id: u64, rx: mpsc::Receiver<KeyValuePair>) {
        self.metrics.key_workers_started(1);
        tokio::spawn(self.clone().run_key_worker(key, id, rx));
    }

    async fn run_key_worker(self: Arc<Self>, key: String, id: u64, mut rx: mpsc::Receiver<KeyValuePair>) {
        let idle = self.settings.key_worker_idle_timeout;
        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(pair)) => self.process_remote_update(pair),
                Ok(None) => break,
                Err(_) => {
                    // Senders enqueue under the entry lock, so an empty
                    // channel checked under the same lock stays empty.
                    let removed = self
                        .key_workers
                        .remove_if(&key, |_, w| w.id == id && rx.is_empty())
                        .is_some();
                    if removed {
                        self.metrics.key_workers_reaped(1);
                        debug!(key = %key, "Reaped idle key worker");
                        break;
                    }
                }
            }
        }
    }

    fn process_remote_update(&self, pair: KeyValuePair) {
        let Some(codec) = self.codecs.get(&pair.codec) else {
            self.metrics.invalid_received_messages(1);
            warn!(key = %pair.key, codec = %pair.codec, "Unknown codec in received message");
            return;
        };
        let value = match codec.decode(&pair.value) {
            Ok(value) => value,
            Err(e) => {
                self.metrics.invalid_received_messages(1);
                warn!(key = %pair.key, error = %e, "Failed to decode received value");
                return;
            }
        };

        let size = pair.value.len();
        let update_time = pair.update_time();
        let merged =
            self.merge_value_for_key(&pair.key, value, pair.deleted, update_time, None, &codec);
        match merged {
            Ok(outcome) => {
                let changes = outcome
                    .change
                    .as_ref()
                    .map(|c| c.merge_content())
                    .unwrap_or_default();
                self.history.add_received(Message {
                    time: Utc::now(),
                    size,
                    pair: pair.clone(),
                    version: outcome.version,
                    changes,
                });
                if outcome.version > 0 {
                    self.notify_watchers(&pair.key);
                    if let Some(change) = outcome.change {
                        self.broadcast_new_value(
                            &pair.key,
                            change.as_ref(),
                            outcome.version,
                            &codec,
                            false,
                            outcome.deleted,
                            outcome.update_time,
                        );
                    }
                }
            }
            Err(e) => warn!(key = %pair.key, error = %e, "Failed to merge received value"),
        }
    }

    /// Every stored entry as length-prefixed key/value records.
    fn local_state(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let store = self.store.lock();
        for (key, desc) in store.iter() {
            let Some(codec) = self.codecs.get(&desc.codec_id) else {
                error!(key = %key, codec = %desc.codec_id, "No codec for stored value");
                continue;
            };
            let value = match codec.encode(desc.value.as_ref()) {
                Ok(value) => value,
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to encode stored value");
                    continue;
                }
            };
            let pair = KeyValuePair {
                key: key.clone(),
                value,
                codec: desc.codec_id.clone(),
                deleted: desc.deleted,
                update_time_millis: time_to_millis(desc.update_time),
            };
            if let Err(e) = put_frame(&mut buf, &pair) {
                error!(key = %key, error = %e, "Failed to frame stored value");
            }
        }
        drop(store);
        self.metrics.pulls_bytes(buf.len() as u64);
        buf
    }

    fn merge_remote_state(&self, data: &[u8], join: bool) {
        self.metrics.pushes_received_bytes(data.len() as u64);
        for frame in frames(data) {
            let pair = match frame {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, join, "Failed to parse remote state");
                    break;
                }
            };
            let Some(codec) = self.codecs.get(&pair.codec) else {
                warn!(key = %pair.key, codec = %pair.codec, "Skipping remote state entry with unknown codec");
                continue;
            };
            let value = match codec.decode(&pair.value) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key = %pair.key, error = %e, "Failed to decode remote state entry");
                    continue;
                }
            };
            match self.merge_value_for_key(
                &pair.key,
                value,
                pair.deleted,
                pair.update_time(),
                None,
                &codec,
            ) {
                Ok(outcome) if outcome.version > 0 => {
                    self.notify_watchers(&pair.key);
                    if let Some(change) = outcome.change {
                        self.broadcast_new_value(
                            &pair.key,
                            change.as_ref(),
                            outcome.version,
                            &codec,
                            false,
                            outcome.deleted,
                            outcome.update_time,
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(key = %pair.key, error = %e, "Failed to merge remote state entry"),
            }
        }
    }
}

/// The store as seen by the membership engine.
#[derive(Debug, Clone)]
pub struct KvDelegate {
    kv: Arc<Kv>,
}

impl Delegate for KvDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        if self.kv.node_meta.len() > limit {
            warn!(
                len = self.kv.node_meta.len(),
                limit, "Node metadata exceeds limit, sending none"
            );
            return Vec::new();
        }
        self.kv.node_meta.clone()
    }

    fn notify_msg(&self, msg: &[u8]) {
        let kv = &self.kv;
        kv.metrics.received_messages(1);
        kv.metrics.received_bytes(msg.len() as u64);

        let pair = match KeyValuePair::decode(msg) {
            Ok(pair) => pair,
            Err(e) => {
                kv.metrics.invalid_received_messages(1);
                warn!(error = %e, "Failed to decode received message");
                return;
            }
        };
        if pair.key.is_empty() {
            kv.metrics.invalid_received_messages(1);
            warn!("Received message without key");
            return;
        }
        if kv.codecs.get(&pair.codec).is_none() {
            kv.metrics.invalid_received_messages(1);
            warn!(key = %pair.key, codec = %pair.codec, "Received message with unknown codec");
            return;
        }
        kv.enqueue_remote_update(pair);
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.kv.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        self.kv.local_state()
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        self.kv.merge_remote_state(buf, join)
    }

    fn notify_cluster_size(&self, num_nodes: usize) {
        self.kv
            .num_nodes
            .store(num_nodes.max(1), Ordering::Relaxed);
        set_cluster_size(num_nodes);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::KvConfig,
        kv::CasFnError,
        mergeable::Mergeable,
        tests::test_utils::{member, ring_codec, test_config, wait_for, TestRing, RING_CODEC},
        zone::{NodeMeta, NodeRole},
    };

    fn encoded(key: &str, ring: &TestRing, deleted: bool) -> Vec<u8> {
        KeyValuePair {
            key: key.to_string(),
            value: ring_codec().encode(ring).unwrap(),
            codec: RING_CODEC.to_string(),
            deleted,
            update_time_millis: Utc::now().timestamp_millis(),
        }
        .encode_to_vec()
    }

    fn attached(cfg: &KvConfig) -> (Arc<Kv>, KvDelegate) {
        let kv = Arc::new(Kv::new(cfg).unwrap());
        let delegate = kv.attach();
        (kv, delegate)
    }

    #[tokio::test]
    async fn test_notify_msg_merges_and_relays() {
        let (kv, delegate) = attached(&test_config("node-a"));
        delegate.notify_msg(&encoded("ring", &TestRing::with(&[member("a", 1)]), false));

        assert!(wait_for(Duration::from_secs(2), || kv.get("ring").is_some()).await);
        // relayed on the gossip queue, not the local one
        assert_eq!(kv.local_broadcasts_pending(), 0);
        assert_eq!(delegate.get_broadcasts(0, 1 << 20).len(), 1);
        assert_eq!(kv.metrics().snapshot().key_workers_started, 1);
    }

    #[test]
    fn test_invalid_messages_counted() {
        let (kv, delegate) = attached(&test_config("node-a"));
        delegate.notify_msg(&[0xff, 0xff, 0xff]);
        delegate.notify_msg(&encoded("", &TestRing::default(), false));

        let unknown = KeyValuePair {
            key: "k".to_string(),
            codec: "nope".to_string(),
            ..Default::default()
        };
        delegate.notify_msg(&unknown.encode_to_vec());

        let snap = kv.metrics().snapshot();
        assert_eq!(snap.received_messages, 3);
        assert_eq!(snap.invalid_received_messages, 3);
        assert_eq!(snap.key_workers_started, 0);
    }

    #[tokio::test]
    async fn test_local_state_roundtrip_between_stores() {
        let (a, a_delegate) = attached(&test_config("node-a"));
        let (b, b_delegate) = attached(&test_config("node-b"));
        let codec = ring_codec();

        for key in ["x", "y"] {
            a.cas(key, &codec, |_| {
                Ok::<_, CasFnError>(Some(
                    Box::new(TestRing::with(&[member("a", 1)])) as Box<dyn Mergeable>
                ))
            })
            .await
            .unwrap();
        }
        a.delete("y").unwrap();

        b_delegate.merge_remote_state(&a_delegate.local_state(false), true);
        assert!(b.get("x").is_some());
        assert!(b.get("y").is_none());
        assert!(b.entry_info("y").is_none(), "a deletion never creates a key");
        assert_eq!(b.list(""), vec!["x"]);
    }

    #[test]
    fn test_truncated_remote_state_keeps_parsed_prefix() {
        let (a, a_delegate) = attached(&test_config("node-a"));
        let codec = ring_codec();
        for key in ["x", "y"] {
            a.merge_value_for_key(
                key,
                Box::new(TestRing::with(&[member("a", 1)])),
                false,
                None,
                None,
                &codec,
            )
            .unwrap();
        }
        let mut state = a_delegate.local_state(false);
        state.truncate(state.len() - 1);

        let (b, b_delegate) = attached(&test_config("node-b"));
        b_delegate.merge_remote_state(&state, false);
        assert_eq!(b.list("").len(), 1);
    }

    #[tokio::test]
    async fn test_idle_key_worker_reaped() {
        let cfg = KvConfig {
            key_worker_idle_timeout: Duration::from_millis(50),
            ..test_config("node-a")
        };
        let (kv, delegate) = attached(&cfg);
        delegate.notify_msg(&encoded("ring", &TestRing::with(&[member("a", 1)]), false));

        assert!(
            wait_for(Duration::from_secs(2), || kv.metrics().snapshot().key_workers_reaped == 1)
                .await
        );
        assert!(kv.key_workers.is_empty());
        assert!(kv.get("ring").is_some());

        // a new message spawns a fresh worker
        delegate.notify_msg(&encoded("ring", &TestRing::with(&[member("b", 1)]), false));
        assert!(
            wait_for(Duration::from_secs(2), || {
                kv.get("ring")
                    .and_then(|v| v.as_any().downcast_ref::<TestRing>().map(|r| r.members.len()))
                    == Some(2)
            })
            .await
        );
        assert_eq!(kv.metrics().snapshot().key_workers_started, 2);
    }

    #[test]
    fn test_node_meta_follows_zone_config() {
        let (_, delegate) = attached(&test_config("node-a"));
        assert!(delegate.node_meta(512).is_empty());

        let mut cfg = test_config("node-b");
        cfg.zone_aware_routing.enabled = true;
        cfg.zone_aware_routing.zone = "zone-1".to_string();
        cfg.zone_aware_routing.role = NodeRole::Bridge;
        let (_, delegate) = attached(&cfg);
        let meta = delegate.node_meta(512);
        let parsed = NodeMeta::parse(&meta).unwrap();
        assert_eq!(parsed.zone(), "zone-1");
        assert_eq!(parsed.role(), NodeRole::Bridge);
        assert!(delegate.node_meta(2).is_empty());
    }
}
