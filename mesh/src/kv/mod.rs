//! Gossip-replicated key/value store.
//!
//! Every key holds one [`Mergeable`] value. Local updates go through
//! [`Kv::cas`] and [`Kv::delete`]; remote updates arrive through the
//! [`KvDelegate`] the membership engine drives. Both paths end in
//! [`Kv::merge_value_for_key`], which applies the value's merge function
//! under the store lock and bumps the per-key version on every accepted
//! change. Net changes are queued for gossip and announced to watchers.

mod delegate;
mod watch;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use prost::Message as _;
use tokio::sync::watch as watch_channel;
use tracing::{debug, error, warn};

pub use delegate::KvDelegate;
use delegate::KeyWorker;
use watch::Watchers;

use crate::{
    broadcast::BroadcastQueue,
    codec::{Codec, CodecRegistry},
    config::KvConfig,
    error::{KvError, KvResult},
    history::{Message, MessageHistory},
    mergeable::Mergeable,
    metrics::{self, KvMetrics},
    wire::{time_to_millis, KeyValuePair},
    zone::encode_node_meta,
};

/// Stored state of one key.
#[derive(Debug, Clone)]
pub struct ValueDesc {
    pub value: Box<dyn Mergeable>,
    /// Incremented on every accepted change. Local to this node.
    pub version: u64,
    pub codec_id: String,
    pub deleted: bool,
    pub update_time: Option<DateTime<Utc>>,
}

/// Metadata of a stored key, without its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub version: u64,
    pub codec_id: String,
    pub deleted: bool,
    pub update_time: Option<DateTime<Utc>>,
}

/// Error returned by a CAS function.
#[derive(Debug)]
pub struct CasFnError {
    pub retry: bool,
    pub source: anyhow::Error,
}

impl CasFnError {
    /// The CAS loop runs the function again, within its retry budget.
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        Self {
            retry: true,
            source: err.into(),
        }
    }

    /// The CAS call fails immediately with this error.
    pub fn abort(err: impl Into<anyhow::Error>) -> Self {
        Self {
            retry: false,
            source: err.into(),
        }
    }
}

impl<E> From<E> for CasFnError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::abort(err)
    }
}

/// Result of merging a value into the store.
#[derive(Debug)]
pub(crate) struct MergeOutcome {
    pub change: Option<Box<dyn Mergeable>>,
    /// New version, or 0 when nothing was stored.
    pub version: u64,
    pub deleted: bool,
    pub update_time: Option<DateTime<Utc>>,
}

impl MergeOutcome {
    fn unchanged(deleted: bool, update_time: Option<DateTime<Utc>>) -> Self {
        Self {
            change: None,
            version: 0,
            deleted,
            update_time,
        }
    }
}

/// Settings the store consults at runtime.
#[derive(Debug, Clone)]
struct StoreSettings {
    max_cas_retries: u32,
    cas_retry_delay: Duration,
    left_ingesters_timeout: Duration,
    obsolete_entries_timeout: Duration,
    notify_interval: Duration,
    watch_prefix_buffer_size: usize,
    key_worker_idle_timeout: Duration,
}

pub struct Kv {
    settings: StoreSettings,
    codecs: CodecRegistry,
    store: Mutex<HashMap<String, ValueDesc>>,
    watchers: Watchers,
    local_broadcasts: BroadcastQueue,
    gossip_broadcasts: BroadcastQueue,
    num_nodes: Arc<AtomicUsize>,
    history: MessageHistory,
    metrics: Arc<KvMetrics>,
    node_meta: Vec<u8>,
    key_workers: DashMap<String, KeyWorker>,
    stopping: AtomicBool,
    shutdown_tx: watch_channel::Sender<bool>,
}

impl fmt::Debug for Kv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kv")
            .field("keys", &self.store.lock().len())
            .field("codecs", &self.codecs.len())
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Kv {
    /// Builds a detached store. Nothing reaches it from the network until
    /// [`Kv::attach`] hands a delegate to the membership engine.
    pub fn new(cfg: &KvConfig) -> KvResult<Self> {
        cfg.validate()?;
        let node_meta = if cfg.zone_aware_routing.enabled {
            encode_node_meta(cfg.zone_aware_routing.role, &cfg.zone_aware_routing.zone)?
        } else {
            Vec::new()
        };

        let num_nodes = Arc::new(AtomicUsize::new(1));
        let (shutdown_tx, _) = watch_channel::channel(false);
        Ok(Self {
            settings: StoreSettings {
                max_cas_retries: cfg.max_cas_retries,
                cas_retry_delay: cfg.cas_retry_delay,
                left_ingesters_timeout: cfg.left_ingesters_timeout,
                obsolete_entries_timeout: cfg.obsolete_entries_timeout,
                notify_interval: cfg.notify_interval,
                watch_prefix_buffer_size: cfg.watch_prefix_buffer_size,
                key_worker_idle_timeout: cfg.key_worker_idle_timeout,
            },
            codecs: CodecRegistry::new(&cfg.codecs),
            store: Mutex::new(HashMap::new()),
            watchers: Watchers::default(),
            local_broadcasts: BroadcastQueue::new(
                "local",
                num_nodes.clone(),
                cfg.retransmit_mult,
                cfg.max_broadcast_queue_len,
            ),
            gossip_broadcasts: BroadcastQueue::new(
                "gossip",
                num_nodes.clone(),
                cfg.retransmit_mult,
                cfg.max_broadcast_queue_len,
            ),
            num_nodes,
            history: MessageHistory::new(cfg.message_history_buffer_bytes),
            metrics: Arc::new(KvMetrics::new()),
            node_meta,
            key_workers: DashMap::new(),
            stopping: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn codec(&self, id: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(id)
    }

    pub fn metrics(&self) -> Arc<KvMetrics> {
        self.metrics.clone()
    }

    pub fn message_history(&self) -> &MessageHistory {
        &self.history
    }

    /// Current value of `key` with all tombstones removed. `None` when the
    /// key is absent or deleted.
    pub fn get(&self, key: &str) -> Option<Box<dyn Mergeable>> {
        let mut value = {
            let store = self.store.lock();
            let desc = store.get(key).filter(|d| !d.deleted)?;
            desc.value.clone()
        };
        value.remove_tombstones(None);
        Some(value)
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        self.store.lock().get(key).map(|d| EntryInfo {
            version: d.version,
            codec_id: d.codec_id.clone(),
            deleted: d.deleted,
            update_time: d.update_time,
        })
    }

    /// Sorted live keys starting with `prefix`.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .lock()
            .iter()
            .filter(|(k, d)| !d.deleted && k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Marks `key` deleted and gossips the deletion. Missing or already
    /// deleted keys are left alone.
    pub fn delete(&self, key: &str) -> KvResult<()> {
        let (value, codec_id) = {
            let store = self.store.lock();
            match store.get(key) {
                Some(desc) if !desc.deleted => (desc.value.clone(), desc.codec_id.clone()),
                _ => return Ok(()),
            }
        };
        let codec = self
            .codecs
            .get(&codec_id)
            .ok_or(KvError::CodecNotFound(codec_id))?;

        let outcome = self.merge_value_for_key(key, value, true, Some(Utc::now()), None, &codec)?;
        if outcome.version > 0 {
            self.notify_watchers(key);
            if let Some(change) = outcome.change {
                self.broadcast_new_value(
                    key,
                    change.as_ref(),
                    outcome.version,
                    &codec,
                    true,
                    outcome.deleted,
                    outcome.update_time,
                );
            }
        }
        Ok(())
    }

    /// Compare-and-swap update of `key`.
    ///
    /// `f` gets the current value (tombstones included, `None` when absent
    /// or deleted) and returns the new value, or `None` when there is
    /// nothing to change. The result is merged in local-CAS mode only if the
    /// key was not modified in between; otherwise `f` runs again.
    pub async fn cas<F>(&self, key: &str, codec: &Arc<dyn Codec>, mut f: F) -> KvResult<()>
    where
        F: FnMut(Option<Box<dyn Mergeable>>) -> Result<Option<Box<dyn Mergeable>>, CasFnError>
            + Send,
    {
        let mut last_err: Option<KvError> = None;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        for _ in 0..self.settings.max_cas_retries {
            self.metrics.cas_attempts(1);

            if matches!(last_err, Some(KvError::NoChangeDetected)) {
                // Merges keyed on coarse timestamps may need time to see the change.
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.cas_retry_delay) => {}
                    _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => {
                        self.metrics.cas_failures(1);
                        return Err(KvError::NotRunning);
                    }
                }
            }

            match self.try_single_cas(key, codec, &mut f) {
                Ok(Some(outcome)) => {
                    self.metrics.cas_successes(1);
                    self.notify_watchers(key);
                    if let Some(change) = outcome.change {
                        self.broadcast_new_value(
                            key,
                            change.as_ref(),
                            outcome.version,
                            codec,
                            true,
                            outcome.deleted,
                            outcome.update_time,
                        );
                    }
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Err(CasAttemptError::Retry(err)) => {
                    debug!(key, error = %err, "CAS attempt failed, retrying");
                    last_err = Some(err);
                }
                Err(CasAttemptError::Fatal(err)) => {
                    self.metrics.cas_failures(1);
                    return Err(err);
                }
            }
        }

        self.metrics.cas_failures(1);
        let source = match last_err {
            None | Some(KvError::VersionMismatch) => KvError::TooManyRetries,
            Some(err) => err,
        };
        Err(KvError::CasFailed {
            key: key.to_string(),
            source: Box::new(source),
        })
    }

    fn try_single_cas<F>(
        &self,
        key: &str,
        codec: &Arc<dyn Codec>,
        f: &mut F,
    ) -> Result<Option<MergeOutcome>, CasAttemptError>
    where
        F: FnMut(Option<Box<dyn Mergeable>>) -> Result<Option<Box<dyn Mergeable>>, CasFnError>,
    {
        let (current, version) = {
            let store = self.store.lock();
            match store.get(key) {
                Some(desc) if desc.deleted => (None, desc.version),
                Some(desc) => (Some(desc.value.clone()), desc.version),
                None => (None, 0),
            }
        };

        let new_value = match f(current) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(CasFnError { retry, source }) => {
                let err = KvError::CasFunction(source);
                return Err(if retry {
                    CasAttemptError::Retry(err)
                } else {
                    CasAttemptError::Fatal(err)
                });
            }
        };

        let now = Some(Utc::now());
        match self.merge_value_for_key(key, new_value, false, now, Some(version), codec) {
            Ok(outcome) if outcome.version == 0 => {
                Err(CasAttemptError::Retry(KvError::NoChangeDetected))
            }
            Ok(outcome) => Ok(Some(outcome)),
            Err(err @ KvError::VersionMismatch) => Err(CasAttemptError::Retry(err)),
            Err(err) => Err(CasAttemptError::Fatal(err)),
        }
    }

    /// Merges `incoming` into the stored value of `key`.
    ///
    /// With an `expected_version` the merge runs in local-CAS mode and fails
    /// with [`KvError::VersionMismatch`] if the stored version differs.
    /// `Some(0)` expects the key to be absent.
    pub(crate) fn merge_value_for_key(
        &self,
        key: &str,
        incoming: Box<dyn Mergeable>,
        incoming_deleted: bool,
        incoming_update_time: Option<DateTime<Utc>>,
        expected_version: Option<u64>,
        codec: &Arc<dyn Codec>,
    ) -> KvResult<MergeOutcome> {
        let mut store = self.store.lock();
        let current = store.get(key);

        let local_cas = expected_version.is_some();
        if let Some(expected) = expected_version {
            if current.map_or(0, |c| c.version) != expected {
                return Err(KvError::VersionMismatch);
            }
        }

        let (mut result, mut change, version, deleted, update_time) = match current {
            // A deletion never creates a key.
            None if incoming_deleted => {
                return Ok(MergeOutcome::unchanged(true, incoming_update_time))
            }
            None => (
                incoming.clone_value(),
                Some(incoming),
                0,
                false,
                None::<DateTime<Utc>>,
            ),
            Some(cur) => {
                let mut result = cur.value.clone();
                let change = result.merge(incoming.as_ref(), local_cas)?;
                (result, change, cur.version, cur.deleted, cur.update_time)
            }
        };

        let mut new_deleted = deleted;
        let mut new_update_time = update_time;
        if incoming_update_time.is_some() && incoming_update_time > update_time {
            new_update_time = incoming_update_time;
            new_deleted = incoming_deleted;
        }

        if let Some(limit) = tombstone_limit(self.settings.left_ingesters_timeout) {
            let (_, removed) = result.remove_tombstones(Some(limit));
            if removed > 0 {
                self.metrics.removed_tombstones(removed as u64);
            }
            // A change made only of expired tombstones is not worth gossiping.
            let emptied = change.as_mut().is_some_and(|c| {
                let (_, removed) = c.remove_tombstones(Some(limit));
                removed > 0 && c.merge_content().is_empty()
            });
            if emptied {
                change = None;
            }
        }

        if change.is_none() && new_deleted == deleted {
            return Ok(MergeOutcome::unchanged(deleted, update_time));
        }

        // Only the deletion flag changed: gossip the whole value with it.
        let change = change.unwrap_or_else(|| result.clone_value());

        let new_version = version + 1;
        store.insert(
            key.to_string(),
            ValueDesc {
                value: result,
                version: new_version,
                codec_id: codec.codec_id().to_string(),
                deleted: new_deleted,
                update_time: new_update_time,
            },
        );
        metrics::set_store_size(store.len());

        Ok(MergeOutcome {
            change: Some(change),
            version: new_version,
            deleted: new_deleted,
            update_time: new_update_time,
        })
    }

    /// Encodes `change` and queues it for gossip. Local changes go to the
    /// priority queue.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn broadcast_new_value(
        &self,
        key: &str,
        change: &dyn Mergeable,
        version: u64,
        codec: &Arc<dyn Codec>,
        local: bool,
        deleted: bool,
        update_time: Option<DateTime<Utc>>,
    ) {
        if local && self.stopping.load(Ordering::Acquire) {
            warn!(key, "Store is stopping, skipping broadcast of local update");
            self.metrics.skipped_local_broadcasts(1);
            return;
        }

        let value = match codec.encode(change) {
            Ok(value) => value,
            Err(e) => {
                error!(key, error = %e, "Failed to encode change for broadcast");
                return;
            }
        };
        let pair = KeyValuePair {
            key: key.to_string(),
            value,
            codec: codec.codec_id().to_string(),
            deleted,
            update_time_millis: time_to_millis(update_time),
        };
        let msg = pair.encode_to_vec();
        let content = change.merge_content();

        self.history.add_sent(Message {
            time: Utc::now(),
            size: msg.len(),
            pair,
            version,
            changes: content.clone(),
        });

        let queue = if local {
            &self.local_broadcasts
        } else {
            &self.gossip_broadcasts
        };
        let dropped = queue.queue(key.to_string(), content, version, msg);
        self.metrics.queued_broadcasts(1);
        if dropped > 0 {
            self.metrics.dropped_broadcasts(dropped as u64);
        }
    }

    /// Removes deleted entries older than the obsolete-entries timeout.
    pub fn cleanup_obsolete_entries(&self) -> usize {
        let now = Utc::now();
        let timeout = self.settings.obsolete_entries_timeout;
        let mut store = self.store.lock();
        let before = store.len();
        store.retain(|key, desc| {
            let expired = desc.deleted
                && desc
                    .update_time
                    .map_or(true, |t| (now - t).to_std().is_ok_and(|age| age > timeout));
            if expired {
                debug!(key = %key, "Removing obsolete entry");
            }
            !expired
        });
        let removed = before - store.len();
        if removed > 0 {
            self.metrics.obsolete_entries_removed(removed as u64);
            metrics::set_store_size(store.len());
        }
        removed
    }

    pub(crate) fn local_broadcasts_pending(&self) -> usize {
        self.local_broadcasts.len()
    }

    pub(crate) fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut out = self.local_broadcasts.get_broadcasts(overhead, limit);
        let used: usize = out.iter().map(|m| overhead + m.len()).sum();
        if used < limit {
            out.extend(self.gossip_broadcasts.get_broadcasts(overhead, limit - used));
        }
        out
    }

    /// Stops broadcasting local updates. Remote updates are still relayed.
    pub(crate) fn set_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Ends watches, CAS retry sleeps and per-key workers.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown_tx.send_replace(true);
        self.key_workers.clear();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

enum CasAttemptError {
    Retry(KvError),
    Fatal(KvError),
}

fn tombstone_limit(timeout: Duration) -> Option<DateTime<Utc>> {
    if timeout.is_zero() {
        return None;
    }
    let timeout = chrono::Duration::from_std(timeout).ok()?;
    Utc::now().checked_sub_signed(timeout)
}
