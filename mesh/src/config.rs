//! Configuration for the KV store, its membership layer and transport.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    codec::Codec,
    error::{KvError, KvResult},
    zone::{NodeRole, MAX_ZONE_LEN},
};

#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KvConfig {
    /// Name of this node in the cluster. Generated when empty.
    pub node_name: String,
    /// Append a random suffix to the node name, so restarts join as a new node.
    pub randomize_node_name: bool,

    /// Address advertised to peers. Derived from the transport when unset.
    pub advertise_addr: Option<String>,
    /// Port advertised to peers. 0 means the bound transport port.
    pub advertise_port: u16,

    /// Seed nodes, as `host:port`.
    pub join_members: Vec<String>,
    pub min_join_backoff: Duration,
    pub max_join_backoff: Duration,
    pub max_join_retries: u32,
    pub abort_if_fast_join_fails: bool,
    pub abort_if_join_fails: bool,
    /// Periodically rejoin the seeds. Zero disables.
    pub rejoin_interval: Duration,

    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before a member is declared dead.
    pub probe_failures_before_dead: u32,
    pub retransmit_mult: usize,
    pub stream_timeout: Duration,
    /// How long dead members stay in the member list.
    pub dead_node_reclaim_time: Duration,
    /// Byte budget of broadcasts per gossip round.
    pub gossip_packet_limit: usize,

    /// Deleted entries are purged after this long.
    pub obsolete_entries_timeout: Duration,
    /// Tombstones inside values older than this are removed on merge.
    /// Zero disables.
    pub left_ingesters_timeout: Duration,
    pub leave_timeout: Duration,
    pub broadcast_timeout_for_local_updates_on_shutdown: Duration,

    /// Size of sent/received message history, in bytes. Zero disables.
    pub message_history_buffer_bytes: usize,
    /// Batch watcher notifications on this interval. Zero notifies inline.
    pub notify_interval: Duration,
    pub watch_prefix_buffer_size: usize,

    pub max_cas_retries: u32,
    /// Delay before retrying a CAS whose merge detected no change.
    pub cas_retry_delay: Duration,
    /// Per-key update workers exit after being idle this long.
    pub key_worker_idle_timeout: Duration,
    pub max_broadcast_queue_len: usize,

    pub tcp_transport: TcpTransportConfig,
    pub zone_aware_routing: ZoneAwareRoutingConfig,

    /// Codecs of the values this store can hold.
    #[serde(skip)]
    pub codecs: Vec<Arc<dyn Codec>>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            randomize_node_name: true,
            advertise_addr: None,
            advertise_port: 0,
            join_members: Vec::new(),
            min_join_backoff: Duration::from_secs(1),
            max_join_backoff: Duration::from_secs(60),
            max_join_retries: 10,
            abort_if_fast_join_fails: false,
            abort_if_join_fails: false,
            rejoin_interval: Duration::ZERO,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            probe_failures_before_dead: 3,
            retransmit_mult: 4,
            stream_timeout: Duration::from_secs(10),
            dead_node_reclaim_time: Duration::from_secs(30),
            gossip_packet_limit: 10 * 1024 * 1024,
            obsolete_entries_timeout: Duration::from_secs(30),
            left_ingesters_timeout: Duration::from_secs(5 * 60),
            leave_timeout: Duration::from_secs(20),
            broadcast_timeout_for_local_updates_on_shutdown: Duration::from_secs(10),
            message_history_buffer_bytes: 0,
            notify_interval: Duration::ZERO,
            watch_prefix_buffer_size: 128,
            max_cas_retries: 10,
            cas_retry_delay: Duration::from_secs(1),
            key_worker_idle_timeout: Duration::from_secs(60),
            max_broadcast_queue_len: 4096,
            tcp_transport: TcpTransportConfig::default(),
            zone_aware_routing: ZoneAwareRoutingConfig::default(),
            codecs: Vec::new(),
        }
    }
}

impl fmt::Debug for KvConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvConfig")
            .field("node_name", &self.node_name)
            .field("advertise_addr", &self.advertise_addr)
            .field("advertise_port", &self.advertise_port)
            .field("join_members", &self.join_members)
            .field("gossip_interval", &self.gossip_interval)
            .field("gossip_nodes", &self.gossip_nodes)
            .field("push_pull_interval", &self.push_pull_interval)
            .field("tcp_transport", &self.tcp_transport)
            .field("zone_aware_routing", &self.zone_aware_routing)
            .field(
                "codecs",
                &self.codecs.iter().map(|c| c.codec_id()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl KvConfig {
    /// Checks settings that would otherwise fail later at runtime.
    pub fn validate(&self) -> KvResult<()> {
        if self.watch_prefix_buffer_size == 0 {
            return Err(KvError::InvalidConfig(
                "watch_prefix_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.gossip_nodes == 0 {
            return Err(KvError::InvalidConfig(
                "gossip_nodes must be greater than 0".to_string(),
            ));
        }
        if self.retransmit_mult == 0 {
            return Err(KvError::InvalidConfig(
                "retransmit_mult must be greater than 0".to_string(),
            ));
        }
        if self.max_cas_retries == 0 {
            return Err(KvError::InvalidConfig(
                "max_cas_retries must be greater than 0".to_string(),
            ));
        }
        if self.gossip_interval.is_zero()
            || self.push_pull_interval.is_zero()
            || self.probe_interval.is_zero()
        {
            return Err(KvError::InvalidConfig(
                "gossip, push/pull and probe intervals must be non-zero".to_string(),
            ));
        }
        if self.min_join_backoff > self.max_join_backoff {
            return Err(KvError::InvalidConfig(format!(
                "min_join_backoff ({:?}) exceeds max_join_backoff ({:?})",
                self.min_join_backoff, self.max_join_backoff
            )));
        }
        self.tcp_transport.validate()?;
        self.zone_aware_routing.validate()?;

        let mut ids: Vec<&str> = self.codecs.iter().map(|c| c.codec_id()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(KvError::InvalidConfig(format!(
                "duplicate codec ids: {:?}",
                ids
            )));
        }
        Ok(())
    }

    /// Node name to register with, applying generation and randomization.
    pub fn effective_node_name(&self) -> String {
        let base = if self.node_name.is_empty() {
            "kv-mesh".to_string()
        } else {
            self.node_name.clone()
        };
        if self.randomize_node_name || self.node_name.is_empty() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", base, &suffix[..8])
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    pub bind_addrs: Vec<String>,
    /// 0 picks a free port.
    pub bind_port: u16,
    pub packet_dial_timeout: Duration,
    pub packet_write_timeout: Duration,
    /// Number of writer tasks sending packets.
    pub max_concurrent_writes: usize,
    /// Packets that cannot be handed to a writer within this time are dropped.
    pub acquire_writer_timeout: Duration,
    /// Largest packet payload sent or accepted.
    pub max_packet_size: usize,
    /// Log every packet and stream.
    pub transport_debug: bool,
    pub tls: TlsConfig,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_addrs: vec!["0.0.0.0".to_string()],
            bind_port: 7946,
            packet_dial_timeout: Duration::from_secs(2),
            packet_write_timeout: Duration::from_secs(5),
            max_concurrent_writes: 3,
            acquire_writer_timeout: Duration::from_millis(250),
            max_packet_size: 16 * 1024 * 1024,
            transport_debug: false,
            tls: TlsConfig::default(),
        }
    }
}

impl TcpTransportConfig {
    pub fn validate(&self) -> KvResult<()> {
        if self.bind_addrs.is_empty() {
            return Err(KvError::InvalidConfig(
                "at least one bind address is required".to_string(),
            ));
        }
        if self.max_concurrent_writes == 0 {
            return Err(KvError::InvalidConfig(
                "max_concurrent_writes must be greater than 0".to_string(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(KvError::InvalidConfig(
                "max_packet_size must be greater than 0".to_string(),
            ));
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(KvError::InvalidConfig(
                "TLS requires cert_path and key_path".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// CA bundle used to verify peers.
    pub ca_path: Option<String>,
    /// Name expected in peer certificates.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ZoneAwareRoutingConfig {
    pub enabled: bool,
    pub zone: String,
    pub role: NodeRole,
}

impl ZoneAwareRoutingConfig {
    pub fn validate(&self) -> KvResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.zone.len() > MAX_ZONE_LEN {
            return Err(KvError::InvalidMetadata(format!(
                "zone {:?} is longer than {} bytes",
                self.zone, MAX_ZONE_LEN
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::tests::test_utils::TestRing;

    #[test]
    fn test_default_config_is_valid() {
        assert!(KvConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_watch_buffer_rejected() {
        let cfg = KvConfig {
            watch_prefix_buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(KvError::InvalidConfig(_))));
    }

    #[test]
    fn test_long_zone_rejected_only_when_enabled() {
        let mut cfg = KvConfig::default();
        cfg.zone_aware_routing.zone = "a-very-long-zone-name".to_string();
        assert!(cfg.validate().is_ok());
        cfg.zone_aware_routing.enabled = true;
        assert!(matches!(cfg.validate(), Err(KvError::InvalidMetadata(_))));
    }

    #[test]
    fn test_duplicate_codecs_rejected() {
        let cfg = KvConfig {
            codecs: vec![
                Arc::new(BincodeCodec::<TestRing>::new("ring")),
                Arc::new(BincodeCodec::<TestRing>::new("ring")),
            ],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(KvError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: KvConfig = serde_json::from_str(
            r#"{"node_name": "node-a", "randomize_node_name": false,
                "zone_aware_routing": {"enabled": true, "zone": "us-east-1a", "role": "bridge"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.effective_node_name(), "node-a");
        assert_eq!(cfg.gossip_nodes, 3);
        assert_eq!(cfg.zone_aware_routing.role, NodeRole::Bridge);
        assert_eq!(cfg.tcp_transport.bind_port, 7946);
    }

    #[test]
    fn test_randomized_name_keeps_prefix() {
        let cfg = KvConfig {
            node_name: "node-a".to_string(),
            ..Default::default()
        };
        let name = cfg.effective_node_name();
        assert!(name.starts_with("node-a-"));
        assert_ne!(name, cfg.effective_node_name());
    }
}
