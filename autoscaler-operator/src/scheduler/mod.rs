//! Scheduler-event watcher: maintains a live view of pending workloads and
//! the set of NodeGroups, and the in-memory cooldown map that gates
//! scale-up decisions.

pub mod convert;
pub mod quantity;

use autoscaler_types::NodeGroup;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TolerationOperator {
    Exists,
    Equal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Toleration {
    pub key: Option<String>,
    pub operator: TolerationOperator,
    pub value: Option<String>,
    pub effect: Option<autoscaler_types::TaintEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: Vec<String>,
}

/// A pending workload descriptor: resource requests, node selectors,
/// tolerations, affinity, namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPod {
    pub name: String,
    pub namespace: String,
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub node_selector: BTreeMap<String, String>,
    pub node_affinity: Vec<NodeSelectorRequirement>,
    pub tolerations: Vec<Toleration>,
}

/// Whether `cooldown` has elapsed since `last_scale` (or there has never
/// been a scale event). Pure so it is directly unit-testable; the watcher
/// below is the stateful wrapper around it.
pub fn cooldown_elapsed(
    last_scale: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> bool {
    match last_scale {
        None => true,
        Some(last) => {
            let elapsed = now.signed_duration_since(last);
            elapsed.to_std().map(|d| d >= cooldown).unwrap_or(true)
        }
    }
}

fn key_for(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Live view of pending pods and NodeGroups, plus the cooldown table.
/// Populated by the controller's watch loop; read by the ResourceAnalyzer
/// and ScaleUpController. No durability: on restart the cooldown map is
/// empty and is seeded lazily from each NodeGroup's `lastScaleTime` the
/// first time it is observed.
pub struct SchedulerWatcher {
    pods: RwLock<Vec<PendingPod>>,
    node_groups: RwLock<Vec<NodeGroup>>,
    last_scale: RwLock<HashMap<String, DateTime<Utc>>>,
    seeded: RwLock<std::collections::HashSet<String>>,
}

impl Default for SchedulerWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerWatcher {
    pub fn new() -> Self {
        Self {
            pods: RwLock::new(Vec::new()),
            node_groups: RwLock::new(Vec::new()),
            last_scale: RwLock::new(HashMap::new()),
            seeded: RwLock::new(std::collections::HashSet::new()),
        }
    }

    pub fn set_pending_pods(&self, pods: Vec<PendingPod>) {
        *self.pods.write().unwrap() = pods;
    }

    pub fn pending_pods(&self) -> Vec<PendingPod> {
        self.pods.read().unwrap().clone()
    }

    pub fn set_node_groups(&self, groups: Vec<NodeGroup>) {
        {
            let mut seeded = self.seeded.write().unwrap();
            let mut last_scale = self.last_scale.write().unwrap();
            for group in &groups {
                let Some(namespace) = group.metadata.namespace.as_deref() else {
                    continue;
                };
                let Some(name) = group.metadata.name.as_deref() else {
                    continue;
                };
                let key = key_for(namespace, name);
                if seeded.insert(key.clone())
                    && let Some(last_scale_time) = group
                        .status
                        .as_ref()
                        .and_then(|s| s.last_scale_time.as_ref())
                {
                    last_scale.insert(key, last_scale_time.0);
                }
            }
        }
        *self.node_groups.write().unwrap() = groups;
    }

    pub fn node_groups(&self) -> Vec<NodeGroup> {
        self.node_groups.read().unwrap().clone()
    }

    pub fn record_scale_event(&self, namespace: &str, name: &str, at: DateTime<Utc>) {
        self.last_scale
            .write()
            .unwrap()
            .insert(key_for(namespace, name), at);
    }

    pub fn can_scale(
        &self,
        namespace: &str,
        name: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> bool {
        let last = self
            .last_scale
            .read()
            .unwrap()
            .get(&key_for(namespace, name))
            .copied();
        cooldown_elapsed(last, now, cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn never_scaled_can_scale_immediately() {
        assert!(cooldown_elapsed(None, t(100), Duration::from_secs(60)));
    }

    #[test]
    fn within_cooldown_cannot_scale() {
        assert!(!cooldown_elapsed(
            Some(t(100)),
            t(130),
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn after_cooldown_can_scale() {
        assert!(cooldown_elapsed(
            Some(t(100)),
            t(161),
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn watcher_seeds_cooldown_from_last_scale_time_once() {
        use autoscaler_types::{NodeGroup, NodeGroupStatus};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
        use kube::api::ObjectMeta;

        let watcher = SchedulerWatcher::new();
        let mut group = NodeGroup {
            metadata: ObjectMeta {
                name: Some("workers".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: Some(NodeGroupStatus {
                last_scale_time: Some(Time(t(500))),
                ..Default::default()
            }),
        };
        watcher.set_node_groups(vec![group.clone()]);
        assert!(!watcher.can_scale("default", "workers", t(520), Duration::from_secs(60)));
        assert!(watcher.can_scale("default", "workers", t(561), Duration::from_secs(60)));

        // A later observation must not re-seed (it would clobber a
        // recorded scale event with the stale status value).
        watcher.record_scale_event("default", "workers", t(600));
        group.status.as_mut().unwrap().last_scale_time = Some(Time(t(0)));
        watcher.set_node_groups(vec![group]);
        assert!(!watcher.can_scale("default", "workers", t(620), Duration::from_secs(60)));
    }
}
