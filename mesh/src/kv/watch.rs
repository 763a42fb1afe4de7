use std::{
    collections::{HashMap, HashSet},
    future::Future,
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::Kv;
use crate::mergeable::Mergeable;

/// Registered watcher channels. Each channel carries changed keys.
#[derive(Debug, Default)]
pub(super) struct Watchers {
    by_key: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    by_prefix: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    pending: Mutex<HashSet<String>>,
}

fn unregister(map: &Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>, key: &str, tx: &mpsc::Sender<String>) {
    let mut map = map.lock();
    if let Some(senders) = map.get_mut(key) {
        senders.retain(|s| !s.same_channel(tx));
        if senders.is_empty() {
            map.remove(key);
        }
    }
}

impl Kv {
    /// Announces a change of `key`, batched when a notify interval is set.
    pub(crate) fn notify_watchers(&self, key: &str) {
        if self.settings.notify_interval.is_zero() {
            self.notify_watchers_now(key);
        } else {
            self.watchers.pending.lock().insert(key.to_string());
        }
    }

    /// Sends batched notifications. Called by the service loop.
    pub(crate) fn flush_pending_notifications(&self) {
        let keys: Vec<String> = self.watchers.pending.lock().drain().collect();
        for key in keys {
            self.notify_watchers_now(&key);
        }
    }

    fn notify_watchers_now(&self, key: &str) {
        if let Some(senders) = self.watchers.by_key.lock().get(key) {
            for tx in senders {
                // depth-1 channel: a full channel already has a pending
                // notification for this key
                let _ = tx.try_send(key.to_string());
            }
        }

        let prefixes = self.watchers.by_prefix.lock();
        for (prefix, senders) in prefixes.iter() {
            if !key.starts_with(prefix.as_str()) {
                continue;
            }
            for tx in senders {
                if let Err(TrySendError::Full(_)) = tx.try_send(key.to_string()) {
                    self.metrics.dropped_prefix_notifications(1);
                    warn!(key, prefix = %prefix, "Prefix watcher is full, dropping notification");
                }
            }
        }
    }

    /// Calls `f` with the value of `key` after every change, until `f`
    /// returns false, `cancel` resolves or the store shuts down.
    ///
    /// Changes that happen while `f` runs are coalesced into one call.
    /// Deleted values are not reported.
    pub async fn watch_key<C, F>(&self, key: &str, cancel: C, mut f: F)
    where
        C: Future<Output = ()>,
        F: FnMut(Box<dyn Mergeable>) -> bool,
    {
        let (tx, mut rx) = mpsc::channel(1);
        self.watchers
            .by_key
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(tx.clone());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::pin!(cancel);
        loop {
            tokio::select! {
                Some(changed) = rx.recv() => {
                    let Some(value) = self.get(&changed) else { continue };
                    if !f(value) {
                        break;
                    }
                }
                _ = &mut cancel => break,
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => break,
            }
        }

        unregister(&self.watchers.by_key, key, &tx);
        debug!(key, "Key watch ended");
    }

    /// Calls `f` with every changed key starting with `prefix` and its
    /// value, until `f` returns false, `cancel` resolves or the store shuts
    /// down.
    ///
    /// Notifications that do not fit the watcher's buffer are dropped.
    pub async fn watch_prefix<C, F>(&self, prefix: &str, cancel: C, mut f: F)
    where
        C: Future<Output = ()>,
        F: FnMut(&str, Box<dyn Mergeable>) -> bool,
    {
        let (tx, mut rx) = mpsc::channel(self.settings.watch_prefix_buffer_size);
        self.watchers
            .by_prefix
            .lock()
            .entry(prefix.to_string())
            .or_default()
            .push(tx.clone());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::pin!(cancel);
        loop {
            tokio::select! {
                Some(changed) = rx.recv() => {
                    let Some(value) = self.get(&changed) else { continue };
                    if !f(&changed, value) {
                        break;
                    }
                }
                _ = &mut cancel => break,
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => break,
            }
        }

        unregister(&self.watchers.by_prefix, prefix, &tx);
        debug!(prefix, "Prefix watch ended");
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        let keys: usize = self.watchers.by_key.lock().values().map(Vec::len).sum();
        let prefixes: usize = self.watchers.by_prefix.lock().values().map(Vec::len).sum();
        keys + prefixes
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        config::KvConfig,
        kv::CasFnError,
        tests::test_utils::{member, ring_codec, test_config, wait_for, TestRing},
    };

    fn put(name: &'static str) -> impl FnMut(
        Option<Box<dyn Mergeable>>,
    ) -> Result<Option<Box<dyn Mergeable>>, CasFnError>
           + Send {
        move |_| Ok(Some(Box::new(TestRing::with(&[member(name, 1)])) as Box<dyn Mergeable>))
    }

    #[tokio::test]
    async fn test_watch_key_sees_changes_until_cancelled() {
        let kv = Arc::new(Kv::new(&test_config("node-a")).unwrap());
        let seen = Arc::new(AtomicUsize::new(0));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let watcher = {
            let kv = kv.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                kv.watch_key(
                    "ring",
                    async {
                        let _ = cancel_rx.await;
                    },
                    |_| {
                        seen.fetch_add(1, Ordering::SeqCst);
                        true
                    },
                )
                .await
            })
        };
        assert!(wait_for(Duration::from_secs(1), || kv.watcher_count() == 1).await);

        kv.cas("ring", &ring_codec(), put("a")).await.unwrap();
        assert!(wait_for(Duration::from_secs(1), || seen.load(Ordering::SeqCst) >= 1).await);

        // other keys do not wake the watcher
        kv.cas("other", &ring_codec(), put("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        cancel_tx.send(()).unwrap();
        watcher.await.unwrap();
        assert_eq!(kv.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_prefix_filters_keys() {
        let kv = Arc::new(Kv::new(&test_config("node-a")).unwrap());
        let (keys_tx, mut keys_rx) = mpsc::unbounded_channel();

        let watcher = {
            let kv = kv.clone();
            tokio::spawn(async move {
                kv.watch_prefix("a/", std::future::pending(), |key, _| {
                    let _ = keys_tx.send(key.to_string());
                    key != "a/2"
                })
                .await
            })
        };
        assert!(wait_for(Duration::from_secs(1), || kv.watcher_count() == 1).await);

        let codec = ring_codec();
        kv.cas("a/1", &codec, put("x")).await.unwrap();
        kv.cas("b/1", &codec, put("x")).await.unwrap();
        kv.cas("a/2", &codec, put("x")).await.unwrap();

        // returning false for a/2 ends the watch
        watcher.await.unwrap();
        let mut keys = Vec::new();
        while let Ok(k) = keys_rx.try_recv() {
            keys.push(k);
        }
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert_eq!(kv.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_watch() {
        let kv = Arc::new(Kv::new(&test_config("node-a")).unwrap());
        let watcher = {
            let kv = kv.clone();
            tokio::spawn(async move {
                kv.watch_key("ring", std::future::pending(), |_| true).await
            })
        };
        assert!(wait_for(Duration::from_secs(1), || kv.watcher_count() == 1).await);
        kv.shutdown();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_full_prefix_watcher_drops_and_counts() {
        let cfg = KvConfig {
            watch_prefix_buffer_size: 1,
            ..test_config("node-a")
        };
        let kv = Kv::new(&cfg).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        kv.watchers
            .by_prefix
            .lock()
            .insert("a/".to_string(), vec![tx]);

        kv.notify_watchers("a/1");
        kv.notify_watchers("a/2");
        assert_eq!(kv.metrics().snapshot().dropped_prefix_notifications, 1);
    }

    #[test]
    fn test_batched_notifications_wait_for_flush() {
        let cfg = KvConfig {
            notify_interval: Duration::from_millis(100),
            ..test_config("node-a")
        };
        let kv = Kv::new(&cfg).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        kv.watchers
            .by_key
            .lock()
            .insert("ring".to_string(), vec![tx]);

        kv.notify_watchers("ring");
        kv.notify_watchers("ring");
        assert!(rx.try_recv().is_err());

        kv.flush_pending_notifications();
        assert_eq!(rx.try_recv().unwrap(), "ring");
        assert!(rx.try_recv().is_err());
    }
}
