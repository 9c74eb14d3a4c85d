//! Converts live cluster `Pod`/`NodeGroup` objects into the
//! [`super::PendingPod`] / matching inputs the ResourceAnalyzer and
//! ScaleUpController work with, and decides which pods count as "pending"
//! for the scheduler-event watcher.

use super::{NodeSelectorRequirement, PendingPod, SelectorOperator, Toleration, TolerationOperator};
use autoscaler_types::TaintEffect;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// A pod is pending, in the `SchedulingEvent`/`PendingPod` sense, when it
/// has not yet been bound to a cluster node, is not being deleted, and the
/// scheduler has reported it unschedulable (`PodScheduled=False`) or it is
/// simply still in `Pending` phase awaiting a decision.
pub fn is_pending(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let scheduled = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_ref())
        .is_some();
    if scheduled {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending")
        == "Pending"
}

fn toleration_operator(op: Option<&str>) -> TolerationOperator {
    match op {
        Some("Exists") => TolerationOperator::Exists,
        _ => TolerationOperator::Equal,
    }
}

fn taint_effect(effect: Option<&str>) -> Option<TaintEffect> {
    match effect {
        Some("NoSchedule") => Some(TaintEffect::NoSchedule),
        Some("PreferNoSchedule") => Some(TaintEffect::PreferNoSchedule),
        Some("NoExecute") => Some(TaintEffect::NoExecute),
        _ => None,
    }
}

fn selector_operator(op: &str) -> SelectorOperator {
    match op {
        "NotIn" => SelectorOperator::NotIn,
        "Exists" => SelectorOperator::Exists,
        "DoesNotExist" => SelectorOperator::DoesNotExist,
        _ => SelectorOperator::In,
    }
}

/// Builds a [`PendingPod`] from a live cluster `Pod`. Returns `None` for
/// pods [`is_pending`] excludes.
pub fn pending_pod_from(pod: &Pod) -> Option<PendingPod> {
    if !is_pending(pod) {
        return None;
    }
    let spec = pod.spec.as_ref()?;

    let mut cpu_millicores = 0u64;
    let mut memory_bytes = 0u64;
    for container in &spec.containers {
        let Some(resources) = container.resources.as_ref() else {
            continue;
        };
        let Some(requests) = resources.requests.as_ref() else {
            continue;
        };
        if let Some(cpu) = requests.get("cpu") {
            cpu_millicores += super::quantity::cpu_millicores(cpu);
        }
        if let Some(mem) = requests.get("memory") {
            memory_bytes += super::quantity::memory_bytes(mem);
        }
    }

    let node_selector = spec
        .node_selector
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();

    let node_affinity = spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|ns| {
            ns.node_selector_terms
                .iter()
                .flat_map(|term| term.match_expressions.iter().flatten())
                .map(|req| NodeSelectorRequirement {
                    key: req.key.clone(),
                    operator: selector_operator(&req.operator),
                    values: req.values.clone().unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let tolerations = spec
        .tolerations
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|t| Toleration {
            key: t.key,
            operator: toleration_operator(t.operator.as_deref()),
            value: t.value,
            effect: taint_effect(t.effect.as_deref()),
        })
        .collect();

    Some(PendingPod {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        cpu_millicores,
        memory_bytes,
        node_selector,
        node_affinity,
        tolerations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_requesting(cpu: &str, mem: &str) -> Pod {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(cpu.into()));
        requests.insert("memory".to_string(), Quantity(mem.into()));
        Pod {
            metadata: ObjectMeta {
                name: Some("p1".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    resources: Some(ResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Pending".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn scheduled_pod_is_not_pending() {
        let mut pod = pod_requesting("1", "1Gi");
        pod.spec.as_mut().unwrap().node_name = Some("worker-1".into());
        assert!(!is_pending(&pod));
        assert!(pending_pod_from(&pod).is_none());
    }

    #[test]
    fn sums_container_requests() {
        let pod = pod_requesting("250m", "512Mi");
        let pending = pending_pod_from(&pod).unwrap();
        assert_eq!(pending.cpu_millicores, 250);
        assert_eq!(pending.memory_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn deleting_pod_is_not_pending() {
        let mut pod = pod_requesting("1", "1Gi");
        pod.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::DateTime::from_timestamp(0, 0).unwrap(),
            ));
        assert!(!is_pending(&pod));
    }
}
