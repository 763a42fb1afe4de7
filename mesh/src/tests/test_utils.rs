//! Shared helpers for crate-internal tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Once},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    codec::{BincodeCodec, Codec},
    config::KvConfig,
    error::MergeError,
    mergeable::Merge,
};

pub const RING_CODEC: &str = "testRing";
pub const COUNTER_CODEC: &str = "testCounter";

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RingState {
    Active,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMember {
    pub timestamp: i64,
    pub state: RingState,
}

/// Ring-like value: members keyed by name, `Left` members are tombstones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRing {
    pub members: BTreeMap<String, TestMember>,
}

pub fn member(name: &str, timestamp: i64) -> (String, TestMember) {
    (
        name.to_string(),
        TestMember {
            timestamp,
            state: RingState::Active,
        },
    )
}

pub fn left_member(name: &str, timestamp: i64) -> (String, TestMember) {
    (
        name.to_string(),
        TestMember {
            timestamp,
            state: RingState::Left,
        },
    )
}

impl TestRing {
    pub fn with(members: &[(String, TestMember)]) -> Self {
        Self {
            members: members.iter().cloned().collect(),
        }
    }

    pub fn active(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|(_, m)| m.state == RingState::Active)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

impl Merge for TestRing {
    fn merge(&mut self, other: &Self, local_cas: bool) -> Result<Option<Self>, MergeError> {
        let mut change = TestRing::default();
        for (name, incoming) in &other.members {
            let newer = match self.members.get(name) {
                None => true,
                Some(current) => {
                    (incoming.timestamp, incoming.state) > (current.timestamp, current.state)
                }
            };
            if newer {
                self.members.insert(name.clone(), *incoming);
                change.members.insert(name.clone(), *incoming);
            }
        }

        if local_cas {
            let now = Utc::now().timestamp();
            for (name, current) in self.members.iter_mut() {
                if current.state == RingState::Active && !other.members.contains_key(name) {
                    current.state = RingState::Left;
                    current.timestamp = now;
                    change.members.insert(name.clone(), *current);
                }
            }
        }

        Ok((!change.members.is_empty()).then_some(change))
    }

    fn merge_content(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    fn remove_tombstones(&mut self, limit: Option<DateTime<Utc>>) -> (usize, usize) {
        let mut total = 0;
        let mut removed = 0;
        self.members.retain(|_, m| {
            if m.state != RingState::Left {
                return true;
            }
            let expired = limit.is_none_or(|l| m.timestamp < l.timestamp());
            if expired {
                removed += 1;
            } else {
                total += 1;
            }
            !expired
        });
        (total, removed)
    }
}

pub fn ring_codec() -> Arc<dyn Codec> {
    Arc::new(BincodeCodec::<TestRing>::new(RING_CODEC))
}

/// Grow-only counter. Carries no member descriptors, so its merge content
/// is always empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounter(pub u64);

impl Merge for TestCounter {
    fn merge(&mut self, other: &Self, _local_cas: bool) -> Result<Option<Self>, MergeError> {
        if other.0 > self.0 {
            self.0 = other.0;
            return Ok(Some(*other));
        }
        Ok(None)
    }

    fn merge_content(&self) -> Vec<String> {
        Vec::new()
    }

    fn remove_tombstones(&mut self, _limit: Option<DateTime<Utc>>) -> (usize, usize) {
        (0, 0)
    }
}

pub fn counter_codec() -> Arc<dyn Codec> {
    Arc::new(BincodeCodec::<TestCounter>::new(COUNTER_CODEC))
}

/// Single-node store config suitable for tests: loopback, free port, no GC
/// of the small timestamps tests use.
pub fn test_config(name: &str) -> KvConfig {
    let mut cfg = KvConfig {
        node_name: name.to_string(),
        randomize_node_name: false,
        left_ingesters_timeout: Duration::ZERO,
        gossip_interval: Duration::from_millis(50),
        push_pull_interval: Duration::from_millis(500),
        probe_interval: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(200),
        min_join_backoff: Duration::from_millis(50),
        max_join_backoff: Duration::from_millis(200),
        max_join_retries: 3,
        cas_retry_delay: Duration::from_millis(10),
        leave_timeout: Duration::from_secs(1),
        broadcast_timeout_for_local_updates_on_shutdown: Duration::from_secs(1),
        codecs: vec![ring_codec(), counter_codec()],
        ..Default::default()
    };
    cfg.tcp_transport.bind_addrs = vec!["127.0.0.1".to_string()];
    cfg.tcp_transport.bind_port = 0;
    cfg
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test]
fn test_ring_merge_laws() {
    let a = TestRing::with(&[member("a", 1), member("b", 5)]);
    let b = TestRing::with(&[member("b", 3), left_member("c", 2)]);
    let c = TestRing::with(&[left_member("a", 4)]);

    // idempotent
    let mut x = a.clone();
    Merge::merge(&mut x, &a, false).unwrap();
    assert_eq!(x, a);

    // commutative
    let mut ab = a.clone();
    Merge::merge(&mut ab, &b, false).unwrap();
    let mut ba = b.clone();
    Merge::merge(&mut ba, &a, false).unwrap();
    assert_eq!(ab, ba);

    // associative
    let mut ab_c = ab.clone();
    Merge::merge(&mut ab_c, &c, false).unwrap();
    let mut bc = b.clone();
    Merge::merge(&mut bc, &c, false).unwrap();
    let mut a_bc = a.clone();
    Merge::merge(&mut a_bc, &bc, false).unwrap();
    assert_eq!(ab_c, a_bc);
}

#[test]
fn test_ring_local_cas_marks_missing_members_left() {
    let mut ring = TestRing::with(&[member("a", 1), member("b", 1)]);
    let change = Merge::merge(&mut ring, &TestRing::with(&[member("a", 1)]), true)
        .unwrap()
        .unwrap();
    assert_eq!(change.merge_content(), vec!["b".to_string()]);
    assert_eq!(ring.active(), vec!["a"]);

    let (total, removed) = ring.remove_tombstones(None);
    assert_eq!((total, removed), (0, 1));
    assert_eq!(ring.members.len(), 1);
}
