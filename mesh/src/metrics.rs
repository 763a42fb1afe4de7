//! Counters for the KV store and the TCP transport.
//!
//! Each counter is kept in-process (readable through a snapshot) and also
//! reported through the `metrics` facade so any installed recorder picks it
//! up. Nothing here installs a recorder.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};

macro_rules! define_counters {
    ($metrics:ident, $snapshot:ident, $prefix:literal, { $($field:ident),* $(,)? }) => {
        #[derive(Debug, Default)]
        pub struct $metrics {
            $($field: AtomicU64,)*
        }

        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $snapshot {
            $(pub $field: u64,)*
        }

        impl $metrics {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }

            $(
                pub fn $field(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                    counter!(concat!($prefix, stringify!($field), "_total")).increment(n);
                }
            )*
        }
    };
}

define_counters!(KvMetrics, KvMetricsSnapshot, "kv_mesh_", {
    cas_attempts,
    cas_successes,
    cas_failures,
    received_messages,
    received_bytes,
    invalid_received_messages,
    dropped_messages,
    dropped_prefix_notifications,
    queued_broadcasts,
    dropped_broadcasts,
    skipped_local_broadcasts,
    pulls_bytes,
    pushes_received_bytes,
    removed_tombstones,
    obsolete_entries_removed,
    key_workers_started,
    key_workers_reaped,
});

define_counters!(TransportMetrics, TransportMetricsSnapshot, "kv_mesh_tcp_", {
    packets_received,
    packets_received_bytes,
    packets_sent,
    packets_sent_bytes,
    packets_dropped,
    packet_write_errors,
    packet_digest_mismatches,
    packets_invalid,
    streams_received,
    streams_dialed,
    unknown_connections,
    accept_errors,
    received_bytes,
    sent_bytes,
});

pub(crate) fn set_store_size(keys: usize) {
    gauge!("kv_mesh_store_keys").set(keys as f64);
}

pub(crate) fn set_cluster_size(nodes: usize) {
    gauge!("kv_mesh_cluster_members").set(nodes as f64);
}
