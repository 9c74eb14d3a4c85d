use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

fn default_scale_cooldown_seconds() -> u64 {
    180
}

fn default_max_pods_per_node() -> u32 {
    110
}

/// A taint applied to provisioned nodes of a [`NodeGroup`], in the same
/// key/value/effect shape Kubernetes uses for node taints.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    pub effect: TaintEffect,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl Default for TaintEffect {
    fn default() -> Self {
        Self::NoSchedule
    }
}

/// Declarative scaling group of functionally-identical worker [`Node`]s
/// bound to one instance type and one IaaS cluster/group.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "autoscaler.vpsie.io",
    version = "v1",
    kind = "NodeGroup",
    plural = "nodegroups",
    derive = "PartialEq",
    status = "NodeGroupStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.minNodes\", \"name\": \"MIN\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.maxNodes\", \"name\": \"MAX\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.desiredNodes\", \"name\": \"DESIRED\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.currentNodes\", \"name\": \"CURRENT\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.readyNodes\", \"name\": \"READY\", \"type\": \"integer\" }"
)]
pub struct NodeGroupSpec {
    pub instance_type: String,
    pub datacenter: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Identifier of the corresponding node group on the IaaS side. `0`
    /// means the NodeGroup has not been registered with the provider yet.
    #[serde(default)]
    pub external_group_id: u64,
    pub cluster_identifier: String,
    #[serde(default = "default_scale_cooldown_seconds")]
    pub scale_cooldown_seconds: u64,
    #[serde(default = "default_max_pods_per_node")]
    pub max_pods_per_node: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeGroupStatus {
    #[serde(default)]
    pub current_nodes: u32,
    #[serde(default)]
    pub desired_nodes: u32,
    #[serde(default)]
    pub ready_nodes: u32,
    pub last_scale_time: Option<Time>,
}

impl NodeGroupSpec {
    pub fn scale_cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scale_cooldown_seconds)
    }
}

/// Per-worker identity tracking one provisioned instance across its
/// lifecycle, owned exclusively by one [`NodeGroup`].
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "autoscaler.vpsie.io",
    version = "v1",
    kind = "Node",
    plural = "nodes",
    derive = "PartialEq",
    status = "NodeStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.nodeGroupName\", \"name\": \"NODEGROUP\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.nodeName\", \"name\": \"CLUSTER-NODE\", \"type\": \"string\" }"
)]
pub struct NodeSpec {
    pub instance_type: String,
    pub node_group_name: String,
    pub datacenter: String,
    pub cluster_identifier: String,
    pub external_group_id: u64,
    /// `0` means the IaaS has not returned a usable identifier yet
    /// (async create accepted, identifier pending; see the
    /// `creation-requested` annotation and the Discoverer).
    #[serde(default)]
    pub iaas_instance_id: u64,
    /// Opaque identifier used for cluster-scoped IaaS operations
    /// (delete-by-cluster-and-node-identifier). Distinct from
    /// `iaas_instance_id`, which may be late or never populated for
    /// Kubernetes-managed discovery.
    #[serde(default)]
    pub iaas_node_identifier: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub ipv6_address: Option<String>,
    /// Intended cluster node name, used by the Joiner as a fallback match
    /// key after IP correlation.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub ssh_key_ids: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum NodePhase {
    #[default]
    Pending,
    Provisioning,
    Provisioned,
    Joining,
    Ready,
    Terminating,
    Deleting,
    Failed,
}

impl FromStr for NodePhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Provisioning" => Ok(Self::Provisioning),
            "Provisioned" => Ok(Self::Provisioned),
            "Joining" => Ok(Self::Joining),
            "Ready" => Ok(Self::Ready),
            "Terminating" => Ok(Self::Terminating),
            "Deleting" => Ok(Self::Deleting),
            "Failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Provisioning => "Provisioning",
            Self::Provisioned => "Provisioned",
            Self::Joining => "Joining",
            Self::Ready => "Ready",
            Self::Terminating => "Terminating",
            Self::Deleting => "Deleting",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NodeConditionType {
    #[serde(rename = "VPSReady")]
    VpsReady,
    NodeJoined,
    NodeReady,
    Error,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl ConditionStatus {
    pub fn from_bool(b: bool) -> Self {
        if b { Self::True } else { Self::False }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Self::True)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub type_: NodeConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<Time>,
    #[serde(default)]
    pub last_update_time: Option<Time>,
}

impl NodeCondition {
    pub fn new(type_: NodeConditionType, status: ConditionStatus) -> Self {
        Self {
            type_,
            status,
            reason: None,
            message: None,
            last_transition_time: None,
            last_update_time: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeResources {
    pub cpu: Option<u32>,
    pub mem_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeStatus {
    #[serde(default)]
    pub phase: NodePhase,
    pub created_at: Option<Time>,
    pub provisioned_at: Option<Time>,
    pub joined_at: Option<Time>,
    pub ready_at: Option<Time>,
    pub terminating_at: Option<Time>,
    pub deleted_at: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
    /// Name of the bound cluster node (ClusterNode), set by the Joiner.
    pub node_name: Option<String>,
    pub hostname: Option<String>,
    pub iaas_status: Option<String>,
    #[serde(default)]
    pub resources: NodeResources,
    pub last_error: Option<String>,
    #[serde(default)]
    pub observed_generation: i64,
}

impl NodeStatus {
    pub fn condition(&self, type_: NodeConditionType) -> Option<&NodeCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn condition_is_true(&self, type_: NodeConditionType) -> bool {
        self.condition(type_).is_some_and(|c| c.status.is_true())
    }

    /// Sets (or inserts) a condition, bumping `last_update_time` always and
    /// `last_transition_time` only when the status value actually changes.
    pub fn set_condition(
        &mut self,
        type_: NodeConditionType,
        status: ConditionStatus,
        reason: Option<String>,
        message: Option<String>,
        now: Time,
    ) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Some(now.clone());
            }
            existing.reason = reason;
            existing.message = message;
            existing.last_update_time = Some(now);
        } else {
            self.conditions.push(NodeCondition {
                type_,
                status,
                reason,
                message,
                last_transition_time: Some(now.clone()),
                last_update_time: Some(now),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> Time {
        Time(chrono::DateTime::from_timestamp(secs, 0).unwrap())
    }

    #[test]
    fn set_condition_sets_transition_time_only_on_change() {
        let mut status = NodeStatus::default();
        status.set_condition(
            NodeConditionType::NodeReady,
            ConditionStatus::False,
            None,
            None,
            t(100),
        );
        let first_transition = status
            .condition(NodeConditionType::NodeReady)
            .unwrap()
            .last_transition_time
            .clone();
        assert_eq!(first_transition, Some(t(100)));

        // Same status value at a later time: transition time must not move.
        status.set_condition(
            NodeConditionType::NodeReady,
            ConditionStatus::False,
            Some("still waiting".into()),
            None,
            t(200),
        );
        let cond = status.condition(NodeConditionType::NodeReady).unwrap();
        assert_eq!(cond.last_transition_time, Some(t(100)));
        assert_eq!(cond.last_update_time, Some(t(200)));

        // Status flips: transition time must move.
        status.set_condition(
            NodeConditionType::NodeReady,
            ConditionStatus::True,
            None,
            None,
            t(300),
        );
        let cond = status.condition(NodeConditionType::NodeReady).unwrap();
        assert_eq!(cond.last_transition_time, Some(t(300)));
    }

    #[test]
    fn phase_roundtrips_through_display_and_fromstr() {
        for phase in [
            NodePhase::Pending,
            NodePhase::Provisioning,
            NodePhase::Provisioned,
            NodePhase::Joining,
            NodePhase::Ready,
            NodePhase::Terminating,
            NodePhase::Deleting,
            NodePhase::Failed,
        ] {
            let s = phase.to_string();
            assert_eq!(s.parse::<NodePhase>().unwrap(), phase);
        }
    }
}
