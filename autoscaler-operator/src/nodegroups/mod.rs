//! NodeGroup materializer (collaborator introduced alongside the
//! NodeLifecycleStateMachine): converges `status.currentNodes`/`readyNodes`
//! with the `Node`s a NodeGroup owns, and creates new `Node` objects when
//! `desiredNodes` exceeds `currentNodes`. Scale-down is out of scope — this
//! only ever adds `Node`s, never deletes them; the Terminator/Drainer path
//! is the only way a `Node` goes away.

pub mod reconcile;

use autoscaler_types::{Node, NodeGroup, NodePhase};
use kube::ResourceExt;

/// Counts of the `Node`s a NodeGroup currently owns, split by whether each
/// one has reached the Ready phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub current: u32,
    pub ready: u32,
}

pub fn count_owned_nodes(group: &NodeGroup, nodes: &[Node]) -> NodeCounts {
    let group_name = group.name_any();
    let owned = nodes.iter().filter(|n| n.spec.node_group_name == group_name);
    let mut counts = NodeCounts::default();
    for node in owned {
        counts.current += 1;
        let phase = node.status.as_ref().map(|s| s.phase).unwrap_or_default();
        if phase == NodePhase::Ready {
            counts.ready += 1;
        }
    }
    counts
}

/// How many new `Node` names to materialize this reconcile, and what to
/// name them. Names are generated with a random suffix rather than
/// sequential indices, since concurrent reconciles must never collide on
/// a name.
pub fn nodes_to_create(group: &NodeGroup, current: u32) -> u32 {
    let desired = group.status.as_ref().map(|s| s.desired_nodes).unwrap_or(0);
    desired.saturating_sub(current)
}

pub fn generate_node_name(group: &NodeGroup) -> String {
    format!("{}-{}", group.name_any(), &uuid::Uuid::new_v4().to_string()[..8])
}
