//! Drainer: cordon, evict, and remove the ClusterNode object for a
//! [`Node`] entering Terminating.

use super::{HandlerContext, PhaseOutcome};
use crate::util::Error;
use autoscaler_types::{Node, NodePhase};
use k8s_openapi::api::core::v1::{Node as K8sNode, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, ResourceExt,
    api::{EvictParams, ListParams, Patch, PatchParams},
};
use std::time::Duration;

const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Exemptions: DaemonSet-owned, static (mirror annotation or
/// ownerless kube-system), already-terminating, or in a terminal phase.
pub fn is_exempt(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    if matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    ) {
        return true;
    }
    let owners = pod.metadata.owner_references.as_deref().unwrap_or(&[]);
    if owners.iter().any(|o| o.kind == "DaemonSet") {
        return true;
    }
    if pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"))
    {
        return true;
    }
    if owners.is_empty() && pod.metadata.namespace.as_deref() == Some("kube-system") {
        return true;
    }
    false
}

pub async fn cordon(client: kube::Client, node_name: &str) -> Result<(), Error> {
    let api: Api<K8sNode> = Api::all(client);
    let patch = Patch::Merge(serde_json::json!({ "spec": { "unschedulable": true } }));
    match api.patch(node_name, &PatchParams::apply(crate::util::MANAGER_NAME), &patch).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn list_node_pods(client: kube::Client, node_name: &str) -> Result<Vec<Pod>, Error> {
    let api: Api<Pod> = Api::all(client);
    let lp = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
    Ok(api.list(&lp).await?.items)
}

/// Evicts each non-exempt pod on `node_name`. A disruption-budget refusal
/// (409) is transient and retried until `timeout` elapses.
pub async fn drain(client: kube::Client, node_name: &str, timeout: Duration) -> Result<(), Error> {
    cordon(client.clone(), node_name).await?;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut remaining: Vec<Pod> = list_node_pods(client.clone(), node_name)
        .await?
        .into_iter()
        .filter(|p| !is_exempt(p))
        .collect();

    while !remaining.is_empty() && tokio::time::Instant::now() < deadline {
        let mut still_pending = Vec::new();
        for pod in remaining {
            let Some(namespace) = pod.metadata.namespace.clone() else {
                continue;
            };
            let name = pod.name_any();
            let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
            match api.evict(&name, &EvictParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(kube::Error::Api(ae)) if ae.code == 429 || ae.code == 409 => {
                    still_pending.push(pod);
                }
                Err(e) => return Err(e.into()),
            }
        }
        remaining = still_pending;
        if !remaining.is_empty() {
            tokio::time::sleep(Duration::from_secs(5).min(GRACE_PERIOD)).await;
        }
    }

    if !remaining.is_empty() {
        return Err(Error::iaas(format!(
            "drain timed out on {node_name} with {} pods remaining",
            remaining.len()
        )));
    }
    Ok(())
}

pub async fn delete_cluster_node(client: kube::Client, name: &str) -> Result<(), Error> {
    let api: Api<K8sNode> = Api::all(client);
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Terminating: drain, continuing to Deleting even on partial failure
/// (the error is recorded, not fatal).
pub async fn handle(ctx: &HandlerContext<'_>, node: &mut Node) -> Result<PhaseOutcome, Error> {
    {
        let status = node.status.get_or_insert_with(Default::default);
        if status.terminating_at.is_none() {
            status.terminating_at = Some(Time(ctx.now));
        }
    }

    if let Some(node_name) = node.status.as_ref().and_then(|s| s.node_name.clone()) {
        if let Err(e) = drain(ctx.client.clone(), &node_name, Duration::from_secs(120)).await {
            let status = node.status.get_or_insert_with(Default::default);
            status.last_error = Some(e.to_string());
        }
    }

    node.status.get_or_insert_with(Default::default).phase = NodePhase::Deleting;
    Ok(PhaseOutcome::immediate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn pod_with(owners: Vec<OwnerReference>, namespace: &str, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(namespace.into()),
                owner_references: if owners.is_empty() { None } else { Some(owners) },
                ..Default::default()
            },
            status: phase.map(|p| PodStatus {
                phase: Some(p.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn daemonset_pods_are_exempt() {
        let owner = OwnerReference {
            kind: "DaemonSet".into(),
            ..Default::default()
        };
        assert!(is_exempt(&pod_with(vec![owner], "default", None)));
    }

    #[test]
    fn ownerless_kube_system_pods_are_exempt() {
        assert!(is_exempt(&pod_with(vec![], "kube-system", None)));
    }

    #[test]
    fn ordinary_pods_are_not_exempt() {
        let owner = OwnerReference {
            kind: "ReplicaSet".into(),
            ..Default::default()
        };
        assert!(!is_exempt(&pod_with(vec![owner], "default", Some("Running"))));
    }

    #[test]
    fn terminal_phase_pods_are_exempt() {
        assert!(is_exempt(&pod_with(vec![], "default", Some("Succeeded"))));
    }
}
