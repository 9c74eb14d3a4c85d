//! Joiner (Joining phase): detects ClusterNode appearance by IP, then
//! configured `nodeName`, then hostname, applies the claim labels, and
//! observes readiness.

use super::{HandlerContext, PhaseOutcome};
use crate::util::Error;
use autoscaler_common::labels;
use autoscaler_types::{ConditionStatus, Node, NodeConditionType, NodePhase};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node as K8sNode;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Api, ResourceExt, api::ListParams};
use std::time::Duration;

const RETRY_INTERVAL: Duration = Duration::from_secs(10);

fn joining_timed_out(provisioned_at: Option<Time>, now: DateTime<Utc>, timeout: Duration) -> bool {
    match provisioned_at {
        None => false,
        Some(t) => (now - t.0).to_std().map(|d| d > timeout).unwrap_or(false),
    }
}

fn node_internal_ip(cn: &K8sNode) -> Option<String> {
    cn.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

/// Picks the ClusterNode matching `node` by IP first, then `nodeName`, then
/// hostname — the exact priority order the Joining handler uses.
fn find_cluster_node<'a>(node: &Node, candidates: &'a [K8sNode]) -> Option<&'a K8sNode> {
    if let Some(ip) = node.spec.ip_address.as_deref() {
        if let Some(found) = candidates.iter().find(|cn| node_internal_ip(cn).as_deref() == Some(ip)) {
            return Some(found);
        }
    }
    if let Some(name) = node.spec.node_name.as_deref() {
        if let Some(found) = candidates.iter().find(|cn| cn.name_any() == name) {
            return Some(found);
        }
    }
    if let Some(hostname) = node.status.as_ref().and_then(|s| s.hostname.as_deref()) {
        if let Some(found) = candidates.iter().find(|cn| cn.name_any() == hostname) {
            return Some(found);
        }
    }
    None
}

fn cluster_node_ready(cn: &K8sNode) -> bool {
    cn.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// The claim binding the ClusterNode to the Node CR by name: `vpsienode`
/// carries the **Node CR's own name**, not the ClusterNode's, so that this
/// matches the label the Discoverer's exclusive claim uses for the same
/// ClusterNode in the async-identifier path.
fn with_claim_labels(matched: &K8sNode, node_cr_name: &str, node_group: &str, datacenter: &str) -> K8sNode {
    let mut matched_owned = matched.clone();
    matched_owned.labels_mut().insert(labels::MANAGED.to_string(), "true".to_string());
    matched_owned
        .labels_mut()
        .insert(labels::NODE_GROUP.to_string(), node_group.to_string());
    matched_owned
        .labels_mut()
        .insert(labels::VPSIE_NODE.to_string(), node_cr_name.to_string());
    matched_owned
        .labels_mut()
        .insert(labels::DATACENTER.to_string(), datacenter.to_string());
    matched_owned
}

pub async fn handle(ctx: &HandlerContext<'_>, node: &mut Node) -> Result<PhaseOutcome, Error> {
    let provisioned_at = node.status.as_ref().and_then(|s| s.provisioned_at.clone());
    if joining_timed_out(provisioned_at, ctx.now, ctx.config.joining_timeout) {
        let status = node.status.get_or_insert_with(Default::default);
        status.phase = NodePhase::Failed;
        status.last_error = Some("joining timeout exceeded".to_string());
        status.set_condition(
            NodeConditionType::Error,
            ConditionStatus::True,
            Some("JoiningTimeout".to_string()),
            Some("joining timeout exceeded".to_string()),
            Time(ctx.now),
        );
        return Ok(PhaseOutcome::immediate());
    }

    let api: Api<K8sNode> = Api::all(ctx.client.clone());
    let candidates = api.list(&ListParams::default()).await?.items;

    let Some(matched) = find_cluster_node(node, &candidates) else {
        let status = node.status.get_or_insert_with(Default::default);
        status.set_condition(
            NodeConditionType::NodeJoined,
            ConditionStatus::False,
            None,
            None,
            Time(ctx.now),
        );
        return Ok(PhaseOutcome::after(RETRY_INTERVAL));
    };

    let matched_name = matched.name_any();
    let ready = cluster_node_ready(matched);

    let matched_owned = with_claim_labels(
        matched,
        &node.name_any(),
        &node.spec.node_group_name,
        &node.spec.datacenter,
    );
    let patch = kube::api::Patch::Merge(serde_json::json!({
        "metadata": { "labels": matched_owned.labels() }
    }));
    api.patch(&matched_name, &kube::api::PatchParams::apply(crate::util::MANAGER_NAME), &patch)
        .await?;

    let status = node.status.get_or_insert_with(Default::default);
    status.node_name = Some(matched_name);
    if ready {
        status.phase = NodePhase::Ready;
        if status.joined_at.is_none() {
            status.joined_at = Some(Time(ctx.now));
        }
        if status.ready_at.is_none() {
            status.ready_at = Some(Time(ctx.now));
        }
        status.set_condition(NodeConditionType::NodeJoined, ConditionStatus::True, None, None, Time(ctx.now));
        status.set_condition(NodeConditionType::NodeReady, ConditionStatus::True, None, None, Time(ctx.now));
        Ok(PhaseOutcome::immediate())
    } else {
        status.set_condition(NodeConditionType::NodeJoined, ConditionStatus::True, None, None, Time(ctx.now));
        status.set_condition(NodeConditionType::NodeReady, ConditionStatus::False, None, None, Time(ctx.now));
        Ok(PhaseOutcome::after(RETRY_INTERVAL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_types::NodeSpec;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition as K8sNodeCondition, NodeStatus as K8sNodeStatus};
    use kube::api::ObjectMeta;

    fn cluster_node(name: &str, ip: Option<&str>, ready: bool) -> K8sNode {
        K8sNode {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            status: Some(K8sNodeStatus {
                addresses: ip.map(|ip| {
                    vec![NodeAddress {
                        type_: "InternalIP".into(),
                        address: ip.into(),
                    }]
                }),
                conditions: Some(vec![K8sNodeCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_with(ip: Option<&str>, node_name: Option<&str>, hostname: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("n1".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: NodeSpec {
                ip_address: ip.map(String::from),
                node_name: node_name.map(String::from),
                ..Default::default()
            },
            status: Some(autoscaler_types::NodeStatus {
                hostname: hostname.map(String::from),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn matches_by_ip_first() {
        let node = node_with(Some("10.0.0.10"), Some("by-name"), None);
        let candidates = vec![
            cluster_node("by-name", None, true),
            cluster_node("by-ip", Some("10.0.0.10"), true),
        ];
        let found = find_cluster_node(&node, &candidates).unwrap();
        assert_eq!(found.name_any(), "by-ip");
    }

    #[test]
    fn falls_back_to_node_name_then_hostname() {
        let node = node_with(None, Some("n"), None);
        let candidates = vec![cluster_node("n", None, true)];
        assert_eq!(find_cluster_node(&node, &candidates).unwrap().name_any(), "n");

        let node = node_with(None, None, Some("host-1"));
        let candidates = vec![cluster_node("host-1", None, true)];
        assert_eq!(find_cluster_node(&node, &candidates).unwrap().name_any(), "host-1");
    }

    #[test]
    fn claim_label_carries_the_node_cr_name_not_the_cluster_node_name() {
        // The Node CR is "n1" (see node_with's fixed metadata.name); the
        // ClusterNode it joins to is named "host-42" — a realistic case
        // where the kubelet-registered hostname differs from the CR name.
        let matched = cluster_node("host-42", Some("10.0.0.10"), true);
        let labeled = with_claim_labels(&matched, "n1", "workers", "dc1");
        assert_eq!(labeled.labels().get(labels::VPSIE_NODE), Some(&"n1".to_string()));
        assert_ne!(labeled.labels().get(labels::VPSIE_NODE), Some(&"host-42".to_string()));
        assert_eq!(labeled.labels().get(labels::NODE_GROUP), Some(&"workers".to_string()));
        assert_eq!(labeled.labels().get(labels::DATACENTER), Some(&"dc1".to_string()));
        assert_eq!(labeled.labels().get(labels::MANAGED), Some(&"true".to_string()));
    }

    #[test]
    fn no_candidates_returns_none() {
        let node = node_with(Some("10.0.0.10"), None, None);
        assert!(find_cluster_node(&node, &[]).is_none());
    }

    #[test]
    fn joining_times_out_after_fifteen_minutes() {
        let t = |s: i64| DateTime::from_timestamp(s, 0).unwrap();
        assert!(joining_timed_out(
            Some(Time(t(0))),
            t(16 * 60),
            Duration::from_secs(15 * 60)
        ));
        assert!(!joining_timed_out(
            Some(Time(t(0))),
            t(14 * 60),
            Duration::from_secs(15 * 60)
        ));
    }
}
