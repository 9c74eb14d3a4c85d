//! Discoverer: resolves the `creationRequested` ambiguity by correlating
//! an unclaimed ClusterNode or a late-reported IaaS VM to an outstanding
//! async provision request.

use super::{HandlerContext, PhaseOutcome};
use crate::iaas::IaasNode;
use crate::util::Error;
use autoscaler_common::annotations;
use autoscaler_types::{ConditionStatus, Node, NodeConditionType, NodePhase};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node as K8sNode;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, ResourceExt,
    api::{ListParams, PostParams},
};
use std::time::Duration;

const RETRY_INTERVAL: Duration = Duration::from_secs(10);

enum Found {
    Vm(IaasNode),
    Synthetic { hostname: String, ip: Option<String> },
}

fn is_control_plane(cn: &K8sNode) -> bool {
    cn.labels().contains_key("node-role.kubernetes.io/control-plane")
        || cn.labels().contains_key("node-role.kubernetes.io/master")
}

fn claimed_by_other(cn: &K8sNode, claim_key: &str, node_name: &str) -> bool {
    cn.labels().get(claim_key).is_some_and(|v| v != node_name)
}

fn cluster_node_ip(cn: &K8sNode) -> Option<String> {
    cn.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP" || a.type_ == "ExternalIP")
        .map(|a| a.address.clone())
}

/// Strategy 1 candidate list: unclaimed, non-control-plane, recent
/// ClusterNodes sorted newest-first.
fn recent_unclaimed_candidates<'a>(
    all: &'a [K8sNode],
    node_name: &str,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Vec<&'a K8sNode> {
    let mut candidates: Vec<&K8sNode> = all
        .iter()
        .filter(|cn| !is_control_plane(cn))
        .filter(|cn| !claimed_by_other(cn, autoscaler_common::labels::VPSIE_NODE, node_name))
        .filter(|cn| {
            cn.creation_timestamp()
                .map(|t| (now - t.0).to_std().map(|d| d <= max_age).unwrap_or(false))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort_by_key(|cn| std::cmp::Reverse(cn.creation_timestamp().map(|t| t.0)));
    candidates
}

fn hostname_prefix_match<'a>(node_name: &str, vms: &'a [IaasNode]) -> Option<&'a IaasNode> {
    let needle = node_name.to_lowercase();
    vms.iter()
        .filter(|vm| vm.is_candidate())
        .find(|vm| vm.hostname.to_lowercase().starts_with(&needle))
}

fn ip_correlated_match<'a>(vms: &'a [IaasNode], cluster_nodes: &[K8sNode], node_name: &str) -> Option<&'a IaasNode> {
    vms.iter().filter(|vm| vm.is_candidate()).find(|vm| {
        let Some(ip) = vm.ip.as_deref() else {
            return false;
        };
        cluster_nodes.iter().any(|cn| {
            cluster_node_ip(cn).as_deref() == Some(ip)
                && !claimed_by_other(cn, autoscaler_common::labels::VPSIE_NODE, node_name)
        })
    })
}

async fn try_claim(api: &Api<K8sNode>, candidate: &K8sNode, node_name: &str) -> Result<bool, Error> {
    let mut modified = candidate.clone();
    modified
        .labels_mut()
        .insert(autoscaler_common::labels::VPSIE_NODE.to_string(), node_name.to_string());
    match api.replace(&candidate.name_any(), &PostParams::default(), &modified).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn discover(ctx: &HandlerContext<'_>, node: &Node) -> Result<Option<Found>, Error> {
    let cluster_nodes_api: Api<K8sNode> = Api::all(ctx.client.clone());
    let cluster_nodes = cluster_nodes_api.list(&ListParams::default()).await?.items;
    let node_name = node.name_any();

    // Strategy 1: claim the newest unclaimed, recent ClusterNode.
    for candidate in recent_unclaimed_candidates(&cluster_nodes, &node_name, ctx.now, ctx.config.max_node_age) {
        if try_claim(&cluster_nodes_api, candidate, &node_name).await? {
            let vms = ctx.iaas.list_nodes().await?;
            let ip = cluster_node_ip(candidate);
            let matched_vm = ip.as_deref().and_then(|ip| vms.iter().find(|vm| vm.ip.as_deref() == Some(ip)));
            return Ok(Some(match matched_vm {
                Some(vm) => Found::Vm(vm.clone()),
                None => Found::Synthetic {
                    hostname: candidate.name_any(),
                    ip,
                },
            }));
        }
    }

    let vms = ctx.iaas.list_nodes().await?;

    // Strategy 2: hostname prefix.
    if let Some(vm) = hostname_prefix_match(&node_name, &vms) {
        return Ok(Some(Found::Vm(vm.clone())));
    }

    // Strategy 3: IP correlation against unclaimed ClusterNodes.
    if let Some(vm) = ip_correlated_match(&vms, &cluster_nodes, &node_name) {
        return Ok(Some(Found::Vm(vm.clone())));
    }

    Ok(None)
}

pub async fn handle(ctx: &HandlerContext<'_>, node: &mut Node) -> Result<PhaseOutcome, Error> {
    let created_at = node.status.as_ref().and_then(|s| s.created_at.clone());
    let timed_out = created_at
        .map(|t| (ctx.now - t.0).to_std().map(|d| d > ctx.config.discovery_timeout).unwrap_or(false))
        .unwrap_or(false);

    if timed_out {
        let status = node.status.get_or_insert_with(Default::default);
        status.phase = NodePhase::Failed;
        status.last_error = Some("discovery timed out".to_string());
        status.set_condition(
            NodeConditionType::Error,
            ConditionStatus::True,
            Some("DiscoveryTimeout".to_string()),
            Some("discovery timed out".to_string()),
            Time(ctx.now),
        );
        return Ok(PhaseOutcome::immediate());
    }

    let Some(found) = discover(ctx, node).await? else {
        return Ok(PhaseOutcome::after(RETRY_INTERVAL));
    };

    node.annotations_mut().remove(annotations::CREATION_REQUESTED);

    match found {
        Found::Vm(vm) if vm.id != 0 => {
            node.spec.iaas_instance_id = vm.id;
            node.spec.ip_address = vm.ip;
            node.spec.ipv6_address = vm.ipv6;
            let status = node.status.get_or_insert_with(Default::default);
            status.hostname = Some(vm.hostname);
            status.iaas_status = vm.status;
            Ok(PhaseOutcome::after(RETRY_INTERVAL))
        }
        Found::Vm(vm) => {
            node.spec.ip_address = vm.ip.clone();
            finish_k8s_managed_discovery(node, vm.ip, Some(vm.hostname), ctx.now);
            Ok(PhaseOutcome::immediate())
        }
        Found::Synthetic { hostname, ip } => {
            node.spec.ip_address = ip.clone();
            finish_k8s_managed_discovery(node, ip, Some(hostname), ctx.now);
            Ok(PhaseOutcome::immediate())
        }
    }
}

fn finish_k8s_managed_discovery(node: &mut Node, ip: Option<String>, hostname: Option<String>, now: DateTime<Utc>) {
    let status = node.status.get_or_insert_with(Default::default);
    status.hostname = hostname;
    status.phase = NodePhase::Provisioned;
    if status.provisioned_at.is_none() {
        status.provisioned_at = Some(Time(now));
    }
    status.set_condition(NodeConditionType::VpsReady, ConditionStatus::True, None, None, Time(now));
    let _ = ip;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus as K8sNodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn cluster_node(name: &str, created: i64, labels: &[(&str, &str)], ip: Option<&str>) -> K8sNode {
        K8sNode {
            metadata: ObjectMeta {
                name: Some(name.into()),
                creation_timestamp: Some(Time(t(created))),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>()),
                ..Default::default()
            },
            status: Some(K8sNodeStatus {
                addresses: ip.map(|ip| vec![NodeAddress { type_: "InternalIP".into(), address: ip.into() }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn excludes_control_plane_and_claimed_and_stale() {
        let nodes = vec![
            cluster_node("cp", 100, &[("node-role.kubernetes.io/control-plane", "")], None),
            cluster_node("claimed", 100, &[("autoscaler.vpsie.io/vpsienode", "other")], None),
            cluster_node("stale", 0, &[], None),
            cluster_node("fresh", 100, &[], None),
        ];
        let candidates = recent_unclaimed_candidates(&nodes, "n1", t(200), Duration::from_secs(60));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name_any(), "fresh");
    }

    #[test]
    fn newest_candidate_sorts_first() {
        let nodes = vec![
            cluster_node("older", 50, &[], None),
            cluster_node("newer", 150, &[], None),
        ];
        let candidates = recent_unclaimed_candidates(&nodes, "n1", t(200), Duration::from_secs(1000));
        assert_eq!(candidates[0].name_any(), "newer");
    }

    #[test]
    fn hostname_prefix_matches_case_insensitively() {
        let vms = vec![IaasNode {
            id: 5,
            identifier: "i-5".into(),
            hostname: "Worker-01.example".into(),
            ip: None,
            ipv6: None,
            status: None,
            cpu: None,
            ram_mb: None,
            disk_gb: None,
        }];
        assert!(hostname_prefix_match("worker-01", &vms).is_some());
        assert!(hostname_prefix_match("worker-02", &vms).is_none());
    }

    #[test]
    fn ip_correlation_requires_unclaimed_cluster_node() {
        let vms = vec![IaasNode {
            id: 7,
            identifier: "i-7".into(),
            hostname: "h".into(),
            ip: Some("10.0.0.5".into()),
            ipv6: None,
            status: Some("running".into()),
            cpu: None,
            ram_mb: None,
            disk_gb: None,
        }];
        let claimed = vec![cluster_node(
            "cn1",
            0,
            &[("autoscaler.vpsie.io/vpsienode", "someone-else")],
            Some("10.0.0.5"),
        )];
        assert!(ip_correlated_match(&vms, &claimed, "n1").is_none());

        let unclaimed = vec![cluster_node("cn1", 0, &[], Some("10.0.0.5"))];
        assert!(ip_correlated_match(&vms, &unclaimed, "n1").is_some());
    }
}
