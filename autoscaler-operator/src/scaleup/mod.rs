//! ScaleUpController: decides and executes NodeGroup scale-ups.

pub mod poll;

use crate::scheduler::SchedulerWatcher;
use crate::util::Error;
use autoscaler_types::NodeGroup;
use chrono::{DateTime, Utc};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};

const MAX_WRITE_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleUpDecision {
    pub node_group: String,
    pub namespace: String,
    pub from: u32,
    pub to: u32,
    pub nodes_to_add: u32,
    pub instance_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleOutcome {
    Skipped { reason: &'static str },
    Decided(ScaleUpDecision),
}

/// Pure decision algorithm: cooldown, then max-capacity, then in-flight
/// accounting, then clamp-to-room. `needed` is the output of
/// `analyzer::estimate_nodes_needed` for the matched deficit.
#[allow(clippy::too_many_arguments)]
pub fn decide_scale_up(
    node_group: &str,
    namespace: &str,
    instance_type: &str,
    max_nodes: u32,
    current_nodes: u32,
    desired_nodes: u32,
    needed: u64,
    can_scale: bool,
) -> ScaleOutcome {
    if !can_scale {
        return ScaleOutcome::Skipped { reason: "cooldown" };
    }
    if desired_nodes >= max_nodes {
        return ScaleOutcome::Skipped {
            reason: "max_capacity",
        };
    }
    let in_flight = desired_nodes.saturating_sub(current_nodes) as u64;
    let need = needed.saturating_sub(in_flight);
    if need == 0 {
        return ScaleOutcome::Skipped {
            reason: "provisioning",
        };
    }
    let room = (max_nodes - desired_nodes) as u64;
    let to_add = need.min(room);
    if to_add == 0 {
        return ScaleOutcome::Skipped {
            reason: "max_capacity",
        };
    }
    ScaleOutcome::Decided(ScaleUpDecision {
        node_group: node_group.to_string(),
        namespace: namespace.to_string(),
        from: desired_nodes,
        to: desired_nodes + to_add as u32,
        nodes_to_add: to_add as u32,
        instance_type: instance_type.to_string(),
    })
}

/// Executes a decision: re-reads the NodeGroup, and either records the
/// scale event if another writer already raised `desiredNodes` to at least
/// `to`, or raises it itself under optimistic concurrency with bounded
/// retry. Never treats a write conflict as fatal — the next reconcile
/// retries.
pub async fn execute(
    client: Client,
    watcher: &SchedulerWatcher,
    decision: &ScaleUpDecision,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let api: Api<NodeGroup> = Api::namespaced(client, &decision.namespace);

    for _ in 0..MAX_WRITE_RETRIES {
        let current = api.get(&decision.node_group).await?;
        let current_desired = current.status.as_ref().map(|s| s.desired_nodes).unwrap_or(0);

        if current_desired >= decision.to {
            watcher.record_scale_event(&decision.namespace, &decision.node_group, now);
            return Ok(());
        }

        let mut modified = current.clone();
        {
            let status = modified.status.get_or_insert_with(Default::default);
            status.desired_nodes = decision.to;
            status.last_scale_time = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now));
        }
        let patch = Patch::Json::<NodeGroup>(json_patch::diff(
            &serde_json::to_value(&current).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        ));

        match api
            .patch_status(
                &decision.node_group,
                &PatchParams::apply(crate::util::MANAGER_NAME),
                &patch,
            )
            .await
        {
            Ok(_) => {
                watcher.record_scale_event(&decision.namespace, &decision.node_group, now);
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(e) => return Err(e.into()),
        }
    }

    // Exhausted retries under conflict; not fatal, next reconcile retries.
    Ok(())
}

pub fn name_and_namespace(group: &NodeGroup) -> (String, String) {
    (group.name_any(), group.namespace().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_scale_up() {
        let outcome = decide_scale_up("workers", "default", "c2", 10, 2, 2, 5, false);
        assert_eq!(outcome, ScaleOutcome::Skipped { reason: "cooldown" });
    }

    #[test]
    fn at_max_capacity_skips() {
        let outcome = decide_scale_up("workers", "default", "c2", 5, 5, 5, 3, true);
        assert_eq!(
            outcome,
            ScaleOutcome::Skipped {
                reason: "max_capacity"
            }
        );
    }

    #[test]
    fn in_flight_nodes_satisfy_deficit_scenario_6() {
        // NodeGroup min=0 max=10 current=2 desired=5; three pending pods
        // each needing 1 CPU on a 4-CPU instance → estimateNodesNeeded=1,
        // in_flight = desired-current = 3 ≥ needed ⇒ skip provisioning.
        let outcome = decide_scale_up("workers", "default", "c2", 10, 2, 5, 1, true);
        assert_eq!(
            outcome,
            ScaleOutcome::Skipped {
                reason: "provisioning"
            }
        );
    }

    #[test]
    fn need_beyond_in_flight_scales_up() {
        let outcome = decide_scale_up("workers", "default", "c2", 10, 2, 3, 5, true);
        // in_flight = 1, need = 4, room = 7 → toAdd = 4, to = 7
        assert_eq!(
            outcome,
            ScaleOutcome::Decided(ScaleUpDecision {
                node_group: "workers".into(),
                namespace: "default".into(),
                from: 3,
                to: 7,
                nodes_to_add: 4,
                instance_type: "c2".into(),
            })
        );
    }

    #[test]
    fn toadd_clamped_to_remaining_capacity() {
        let outcome = decide_scale_up("workers", "default", "c2", 10, 0, 8, 20, true);
        // room = 2, so to_add is clamped to 2 even though need is huge
        assert_eq!(
            outcome,
            ScaleOutcome::Decided(ScaleUpDecision {
                node_group: "workers".into(),
                namespace: "default".into(),
                from: 8,
                to: 10,
                nodes_to_add: 2,
                instance_type: "c2".into(),
            })
        );
    }
}
