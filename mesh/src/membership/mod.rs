//! Membership layer: the callback contracts a store plugs into and a
//! minimal gossip engine driving them.
//!
//! The engine is intentionally small. It disseminates delegate broadcasts,
//! runs push/pull anti-entropy, probes peers over streams and tracks
//! alive/suspect/dead/left states with incarnation numbers. It has no
//! indirect probing or awareness scoring.

mod engine;
mod messages;

use std::net::SocketAddr;

use rand::seq::{IndexedRandom, SliceRandom};
use serde::{Deserialize, Serialize};

pub use engine::{Memberlist, MemberlistConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl NodeState {
    /// Members worth sending traffic to.
    pub fn is_live(self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    /// Opaque delegate metadata, see [`crate::zone`].
    pub meta: Vec<u8>,
    pub state: NodeState,
    pub incarnation: u64,
}

impl Member {
    /// True if `other` is newer information about the same member.
    pub(crate) fn is_superseded_by(&self, other: &Member) -> bool {
        (other.incarnation, other.state) > (self.incarnation, self.state)
    }
}

/// Callbacks the engine invokes on the store.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata attached to this node's member record, at most `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message received from a peer.
    fn notify_msg(&self, msg: &[u8]);

    /// Messages to piggyback on the next gossip round. Each costs
    /// `overhead + len` bytes of the `limit` budget.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state for push/pull.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Full remote state received through push/pull.
    fn merge_remote_state(&self, buf: &[u8], join: bool);

    fn notify_cluster_size(&self, _num_nodes: usize) {}
}

#[derive(Debug, Clone, Default)]
pub struct NodeSelection {
    pub selected: Vec<Member>,
    /// A node that should be among the chosen targets if possible.
    pub preferred: Option<Member>,
}

/// Filters the candidate set whenever the engine picks gossip, probe or
/// push/pull targets.
pub trait NodeSelectionDelegate: Send + Sync + 'static {
    fn select_nodes(&self, nodes: &[Member]) -> NodeSelection;

    /// Number of peers to push/pull with per interval.
    fn push_pull_peers(&self) -> usize {
        1
    }

    /// Peers to push/pull with this interval.
    fn push_pull_targets(&self, nodes: &[Member]) -> Vec<Member> {
        pick_targets(self.select_nodes(nodes), self.push_pull_peers())
    }
}

/// Passes every node through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectAll;

impl NodeSelectionDelegate for SelectAll {
    fn select_nodes(&self, nodes: &[Member]) -> NodeSelection {
        NodeSelection {
            selected: nodes.to_vec(),
            preferred: None,
        }
    }
}

/// Picks up to `k` random targets from a selection, making sure the
/// preferred node is one of them.
pub(crate) fn pick_targets(selection: NodeSelection, k: usize) -> Vec<Member> {
    let NodeSelection {
        mut selected,
        preferred,
    } = selection;
    let mut rng = rand::rng();

    let mut chosen: Vec<Member> = if k >= selected.len() {
        selected.shuffle(&mut rng);
        selected
    } else {
        selected.choose_multiple(&mut rng, k).cloned().collect()
    };

    if let Some(preferred) = preferred {
        if k > 0 && !chosen.iter().any(|m| m.name == preferred.name) {
            if chosen.len() >= k {
                chosen.pop();
            }
            chosen.insert(0, preferred);
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, port: u16) -> Member {
        Member {
            name: name.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            meta: Vec::new(),
            state: NodeState::Alive,
            incarnation: 0,
        }
    }

    #[test]
    fn test_state_ordering_and_supersede() {
        let alive = node("a", 1);
        let mut suspect = alive.clone();
        suspect.state = NodeState::Suspect;
        assert!(alive.is_superseded_by(&suspect));
        assert!(!suspect.is_superseded_by(&alive));

        let mut refuted = alive.clone();
        refuted.incarnation = 1;
        assert!(suspect.is_superseded_by(&refuted));
        assert!(NodeState::Dead < NodeState::Left);
    }

    #[test]
    fn test_pick_targets_limits_and_keeps_preferred() {
        let nodes: Vec<Member> = (0..10).map(|i| node(&format!("n{i}"), i)).collect();
        let preferred = node("bridge", 99);
        let chosen = pick_targets(
            NodeSelection {
                selected: nodes.clone(),
                preferred: Some(preferred),
            },
            3,
        );
        assert_eq!(chosen.len(), 3);
        assert_eq!(chosen[0].name, "bridge");

        let all = pick_targets(SelectAll.select_nodes(&nodes), 20);
        assert_eq!(all.len(), 10);
        assert!(pick_targets(SelectAll.select_nodes(&nodes), 0).is_empty());
    }
}
