//! Zone-aware peer selection.
//!
//! Nodes advertise `{role, zone}` in their member metadata. Members gossip
//! only within their zone; bridges additionally reach bridges of other
//! zones, so state crosses zone boundaries through a few links instead of
//! through every node.
//!
//! Metadata layout: `[version=1][role][zone len][zone utf-8]`.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use metrics::counter;
use rand::{seq::IndexedRandom, Rng};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{KvError, KvResult},
    membership::{pick_targets, Member, NodeSelection, NodeSelectionDelegate},
};

pub const META_VERSION: u8 = 1;
pub const MAX_ZONE_LEN: usize = 16;
pub const MAX_META_LEN: usize = 3 + MAX_ZONE_LEN;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Member,
    Bridge,
}

impl NodeRole {
    fn as_byte(self) -> u8 {
        match self {
            NodeRole::Member => 1,
            NodeRole::Bridge => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(NodeRole::Member),
            2 => Some(NodeRole::Bridge),
            _ => None,
        }
    }
}

pub fn encode_node_meta(role: NodeRole, zone: &str) -> KvResult<Vec<u8>> {
    if zone.len() > MAX_ZONE_LEN {
        return Err(KvError::InvalidMetadata(format!(
            "zone {:?} exceeds {} bytes",
            zone, MAX_ZONE_LEN
        )));
    }
    let mut buf = Vec::with_capacity(3 + zone.len());
    buf.push(META_VERSION);
    buf.push(role.as_byte());
    buf.push(zone.len() as u8);
    buf.extend_from_slice(zone.as_bytes());
    Ok(buf)
}

/// Borrowed view over encoded metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta<'a> {
    role: NodeRole,
    zone: &'a str,
}

impl<'a> NodeMeta<'a> {
    /// Parses metadata, returning `None` for anything malformed or of an
    /// unknown version.
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        let (&version, rest) = buf.split_first()?;
        if version != META_VERSION {
            return None;
        }
        let (&role, rest) = rest.split_first()?;
        let role = NodeRole::from_byte(role)?;
        let (&len, rest) = rest.split_first()?;
        let len = len as usize;
        if len > MAX_ZONE_LEN || rest.len() != len {
            return None;
        }
        let zone = std::str::from_utf8(rest).ok()?;
        Some(Self { role, zone })
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn zone(&self) -> &'a str {
        self.zone
    }
}

#[derive(Debug, Default)]
struct ZoneTally {
    nodes: usize,
    live_bridges: usize,
}

#[derive(Debug)]
pub struct ZoneAwareNodeSelection {
    zone: String,
    role: NodeRole,
    fallbacks: AtomicU64,
}

impl ZoneAwareNodeSelection {
    pub fn new(zone: impl Into<String>, role: NodeRole) -> Self {
        Self {
            zone: zone.into(),
            role,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Rounds in which filtering was bypassed because a zone had no live
    /// bridge.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Zone with members but no live bridge, if any. The local node counts
    /// toward its own zone.
    fn zone_without_bridge<'a>(&'a self, nodes: &'a [Member]) -> Option<&'a str> {
        let mut zones: HashMap<&str, ZoneTally> = HashMap::new();
        let local = zones.entry(self.zone.as_str()).or_default();
        local.nodes += 1;
        if self.role == NodeRole::Bridge {
            local.live_bridges += 1;
        }

        for node in nodes {
            let Some(meta) = NodeMeta::parse(&node.meta).filter(|m| !m.zone().is_empty()) else {
                continue;
            };
            let tally = zones.entry(meta.zone()).or_default();
            tally.nodes += 1;
            if meta.role() == NodeRole::Bridge && node.state.is_live() {
                tally.live_bridges += 1;
            }
        }

        zones
            .into_iter()
            .find(|(_, t)| t.nodes > 0 && t.live_bridges == 0)
            .map(|(zone, _)| zone)
    }

    /// Same zone as the local node, or no zone at all.
    fn is_zone_local(&self, node: &Member) -> bool {
        NodeMeta::parse(&node.meta)
            .filter(|m| !m.zone().is_empty())
            .is_none_or(|m| m.zone() == self.zone)
    }
}

impl NodeSelectionDelegate for ZoneAwareNodeSelection {
    fn select_nodes(&self, nodes: &[Member]) -> NodeSelection {
        if self.zone.is_empty() {
            return NodeSelection {
                selected: nodes.to_vec(),
                preferred: None,
            };
        }

        if let Some(zone) = self.zone_without_bridge(nodes) {
            warn!(
                zone,
                local_zone = %self.zone,
                "Zone has no live bridge, bypassing zone-aware node selection"
            );
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            counter!("kv_mesh_zone_aware_fallback_total").increment(1);
            return NodeSelection {
                selected: nodes.to_vec(),
                preferred: None,
            };
        }

        let mut rng = rand::rng();
        let mut selected = Vec::with_capacity(nodes.len());
        let mut preferred = None;
        let mut bridges_seen = 0u32;

        for node in nodes {
            let meta = NodeMeta::parse(&node.meta).filter(|m| !m.zone().is_empty());
            match meta {
                None => selected.push(node.clone()),
                Some(m) if m.zone() == self.zone => selected.push(node.clone()),
                Some(m) if self.role == NodeRole::Bridge && m.role() == NodeRole::Bridge => {
                    selected.push(node.clone());
                    // reservoir sample of size one
                    bridges_seen += 1;
                    if rng.random_range(0..bridges_seen) == 0 {
                        preferred = Some(node.clone());
                    }
                }
                Some(_) => {}
            }
        }

        NodeSelection {
            selected,
            preferred,
        }
    }

    fn push_pull_peers(&self) -> usize {
        match self.role {
            NodeRole::Bridge if !self.zone.is_empty() => 2,
            _ => 1,
        }
    }

    /// A bridge syncs with one node of its own zone and one remote bridge
    /// when both exist.
    fn push_pull_targets(&self, nodes: &[Member]) -> Vec<Member> {
        let selection = self.select_nodes(nodes);
        let Some(remote) = selection.preferred.clone() else {
            return pick_targets(selection, self.push_pull_peers());
        };
        let local: Vec<&Member> = selection
            .selected
            .iter()
            .filter(|n| self.is_zone_local(n))
            .collect();
        match local.choose(&mut rand::rng()) {
            Some(&local) => vec![local.clone(), remote],
            None => pick_targets(selection, self.push_pull_peers()),
        }
    }
}
