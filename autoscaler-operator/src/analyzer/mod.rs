//! ResourceAnalyzer: matches pending pods to eligible NodeGroups and
//! estimates how many additional nodes each match needs.

use crate::scheduler::{NodeSelectorRequirement, PendingPod, SelectorOperator, Toleration, TolerationOperator};
use autoscaler_types::{NodeGroup, Taint, TaintEffect};
use kube::ResourceExt;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceDeficit {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub pod_count: u64,
}

impl ResourceDeficit {
    fn add_pod(&mut self, pod: &PendingPod) {
        self.cpu_millicores += pod.cpu_millicores;
        self.memory_bytes += pod.memory_bytes;
        self.pod_count += 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InstanceInfo {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct NodeGroupMatch {
    pub node_group: NodeGroup,
    pub matching_pods: Vec<String>,
    pub deficit: ResourceDeficit,
}

fn selector_satisfied(group_labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| group_labels.get(k) == Some(v))
}

fn affinity_satisfied(group_labels: &BTreeMap<String, String>, reqs: &[NodeSelectorRequirement]) -> bool {
    reqs.iter().all(|req| match req.operator {
        SelectorOperator::Exists => group_labels.contains_key(&req.key),
        SelectorOperator::DoesNotExist => !group_labels.contains_key(&req.key),
        SelectorOperator::In => group_labels
            .get(&req.key)
            .is_some_and(|v| req.values.contains(v)),
        SelectorOperator::NotIn => group_labels
            .get(&req.key)
            .is_none_or(|v| !req.values.contains(v)),
    })
}

/// A pod tolerates a taint if it has a matching toleration (key+effect,
/// operator Exists ignoring value or Equal matching value), or the taint's
/// effect is PreferNoSchedule (a soft preference, never blocks scheduling).
fn pod_tolerates_taint(tolerations: &[Toleration], taint: &Taint) -> bool {
    if taint.effect == TaintEffect::PreferNoSchedule {
        return true;
    }
    tolerations.iter().any(|t| {
        let key_matches = t.key.as_deref().is_none_or(|k| k == taint.key);
        let effect_matches = t.effect.is_none_or(|e| e == taint.effect);
        let value_matches = match t.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => t.value.as_deref() == taint.value.as_deref(),
        };
        key_matches && effect_matches && value_matches
    })
}

fn node_group_eligible(group: &NodeGroup, pod: &PendingPod) -> bool {
    selector_satisfied(&group.spec.labels, &pod.node_selector)
        && affinity_satisfied(&group.spec.labels, &pod.node_affinity)
        && group
            .spec
            .taints
            .iter()
            .all(|taint| pod_tolerates_taint(&pod.tolerations, taint))
}

fn spare_capacity(group: &NodeGroup) -> i64 {
    let status = group.status.as_ref();
    let desired = status.map(|s| s.desired_nodes).unwrap_or(0) as i64;
    let max = group.spec.max_nodes as i64;
    max - desired
}

/// Finds, for each NodeGroup, the pending pods it is eligible to serve and
/// the resulting resource deficit. Ties (when ranking matters to the
/// caller) are broken by densest fit first (fewer spare nodes), then
/// lexicographic NodeGroup name.
pub fn find_matching_node_groups(pods: &[PendingPod], node_groups: &[NodeGroup]) -> Vec<NodeGroupMatch> {
    let mut matches: Vec<NodeGroupMatch> = node_groups
        .iter()
        .map(|group| {
            let mut deficit = ResourceDeficit::default();
            let mut matching_pods = Vec::new();
            for pod in pods {
                if node_group_eligible(group, pod) {
                    deficit.add_pod(pod);
                    matching_pods.push(pod.name.clone());
                }
            }
            NodeGroupMatch {
                node_group: group.clone(),
                matching_pods,
                deficit,
            }
        })
        .filter(|m| m.deficit.pod_count > 0)
        .collect();

    matches.sort_by(|a, b| {
        spare_capacity(&a.node_group)
            .cmp(&spare_capacity(&b.node_group))
            .then_with(|| a.node_group.name_any().cmp(&b.node_group.name_any()))
    });
    matches
}

fn div_ceil_u64(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return 0;
    }
    numerator.div_ceil(denominator)
}

/// `max(ceil(deficit.cpu/instance.cpu), ceil(deficit.mem/instance.mem),
/// ceil(deficit.pods/maxPodsPerNode))`.
pub fn estimate_nodes_needed(deficit: &ResourceDeficit, instance: &InstanceInfo, max_pods_per_node: u32) -> u64 {
    let by_cpu = div_ceil_u64(deficit.cpu_millicores, instance.cpu_millicores);
    let by_mem = div_ceil_u64(deficit.memory_bytes, instance.memory_bytes);
    let by_pods = div_ceil_u64(deficit.pod_count, max_pods_per_node as u64);
    by_cpu.max(by_mem).max(by_pods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_types::{NodeGroupSpec, NodeGroupStatus};
    use kube::api::ObjectMeta;

    fn group(name: &str, labels: &[(&str, &str)], max_nodes: u32, desired: u32) -> NodeGroup {
        NodeGroup {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: NodeGroupSpec {
                instance_type: "c2".into(),
                datacenter: "dc1".into(),
                min_nodes: 0,
                max_nodes,
                labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                taints: vec![],
                external_group_id: 1,
                cluster_identifier: "c".into(),
                scale_cooldown_seconds: 180,
                max_pods_per_node: 110,
            },
            status: Some(NodeGroupStatus {
                desired_nodes: desired,
                ..Default::default()
            }),
        }
    }

    fn pod(name: &str, cpu: u64, mem: u64, selector: &[(&str, &str)]) -> PendingPod {
        PendingPod {
            name: name.into(),
            namespace: "default".into(),
            cpu_millicores: cpu,
            memory_bytes: mem,
            node_selector: selector.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            node_affinity: vec![],
            tolerations: vec![],
        }
    }

    #[test]
    fn matches_pods_by_node_selector() {
        let groups = vec![
            group("gpu", &[("gpu", "true")], 10, 2),
            group("general", &[], 10, 2),
        ];
        let pods = vec![pod("p1", 1000, 1 << 20, &[("gpu", "true")])];
        let matches = find_matching_node_groups(&pods, &groups);
        // Only "gpu" carries the label the pod's nodeSelector requires;
        // "general" has no labels at all and is not eligible.
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].node_group.name_any(), "gpu");
    }

    #[test]
    fn excludes_groups_missing_required_label() {
        let groups = vec![group("general", &[], 10, 2)];
        let pods = vec![pod("p1", 1000, 1 << 20, &[("gpu", "true")])];
        let matches = find_matching_node_groups(&pods, &groups);
        assert!(matches.is_empty());
    }

    #[test]
    fn taint_without_toleration_excludes_group() {
        let mut tainted = group("tainted", &[], 10, 0);
        tainted.spec.taints.push(Taint {
            key: "dedicated".into(),
            value: Some("ml".into()),
            effect: TaintEffect::NoSchedule,
        });
        let groups = vec![tainted];
        let pods = vec![pod("p1", 1000, 1 << 20, &[])];
        assert!(find_matching_node_groups(&pods, &groups).is_empty());
    }

    #[test]
    fn toleration_allows_tainted_group() {
        let mut tainted = group("tainted", &[], 10, 0);
        tainted.spec.taints.push(Taint {
            key: "dedicated".into(),
            value: Some("ml".into()),
            effect: TaintEffect::NoSchedule,
        });
        let groups = vec![tainted];
        let mut p = pod("p1", 1000, 1 << 20, &[]);
        p.tolerations.push(Toleration {
            key: Some("dedicated".into()),
            operator: TolerationOperator::Equal,
            value: Some("ml".into()),
            effect: Some(TaintEffect::NoSchedule),
        });
        let matches = find_matching_node_groups(&[p], &groups);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn densest_fit_ranked_before_spacious_group() {
        let groups = vec![
            group("spacious", &[], 20, 0),
            group("dense", &[], 3, 2),
        ];
        let pods = vec![pod("p1", 1000, 1 << 20, &[])];
        let matches = find_matching_node_groups(&pods, &groups);
        assert_eq!(matches[0].node_group.name_any(), "dense");
    }

    #[test]
    fn estimate_takes_the_binding_constraint() {
        let deficit = ResourceDeficit {
            cpu_millicores: 9000,
            memory_bytes: 2 << 30,
            pod_count: 250,
        };
        let instance = InstanceInfo {
            cpu_millicores: 4000,
            memory_bytes: 16 << 30,
        };
        // by_cpu = ceil(9000/4000) = 3, by_mem = 1, by_pods = ceil(250/110) = 3
        assert_eq!(estimate_nodes_needed(&deficit, &instance, 110), 3);
    }
}
