//! NodeLifecycleStateMachine: per-phase handlers advancing a [`Node`]
//! through its fixed phase graph. Handlers mutate in-memory status only;
//! persisting the result is the reconciler's job.

pub mod discoverer;
pub mod drainer;
pub mod joiner;
pub mod provisioner;
pub mod terminator;

use crate::iaas::IaasClient;
use crate::util::Error;
use autoscaler_types::{ConditionStatus, Node, NodeConditionType, NodePhase};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;

/// Per-phase wall-clock timeouts and the Failed-state TTL. `failed_ttl ==
/// Duration::ZERO` disables Failed-TTL deletion entirely.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub provisioning_timeout: Duration,
    pub joining_timeout: Duration,
    pub discovery_timeout: Duration,
    pub max_node_age: Duration,
    pub failed_ttl: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            provisioning_timeout: Duration::from_secs(10 * 60),
            joining_timeout: Duration::from_secs(15 * 60),
            discovery_timeout: Duration::from_secs(15 * 60),
            max_node_age: Duration::from_secs(30 * 60),
            failed_ttl: Duration::ZERO,
        }
    }
}

pub struct PhaseOutcome {
    pub requeue_after: Duration,
    /// Set by the Failed handler once the TTL has elapsed: the reconciler
    /// must issue a delete of the Node entity so its finalizer cascades
    /// through Terminating/Deleting.
    pub delete: bool,
}

impl PhaseOutcome {
    pub fn after(d: Duration) -> Self {
        Self {
            requeue_after: d,
            delete: false,
        }
    }

    pub fn immediate() -> Self {
        Self::after(Duration::ZERO)
    }

    pub fn delete_now() -> Self {
        Self {
            requeue_after: Duration::ZERO,
            delete: true,
        }
    }
}

pub struct HandlerContext<'a> {
    pub client: Client,
    pub iaas: Arc<dyn IaasClient>,
    pub config: &'a LifecycleConfig,
    pub now: DateTime<Utc>,
}

/// The single dispatch point: a tagged variant keyed by phase, not open
/// inheritance.
pub async fn handle(ctx: &HandlerContext<'_>, node: &mut Node) -> Result<PhaseOutcome, Error> {
    let phase = node.status.as_ref().map(|s| s.phase).unwrap_or_default();
    match phase {
        NodePhase::Pending => Ok(handle_pending(node, ctx.now)),
        NodePhase::Provisioning => provisioner::handle(ctx, node).await,
        NodePhase::Provisioned => Ok(handle_provisioned(node, ctx.now)),
        NodePhase::Joining => joiner::handle(ctx, node).await,
        NodePhase::Ready => handle_ready(ctx, node).await,
        NodePhase::Terminating => drainer::handle(ctx, node).await,
        NodePhase::Deleting => terminator::handle(ctx, node).await,
        NodePhase::Failed => Ok(handle_failed(node, ctx.config.failed_ttl, ctx.now)),
    }
}

fn handle_pending(node: &mut Node, now: DateTime<Utc>) -> PhaseOutcome {
    let status = node.status.get_or_insert_with(Default::default);
    status.phase = NodePhase::Provisioning;
    if status.created_at.is_none() {
        status.created_at = Some(Time(now));
    }
    status.set_condition(
        NodeConditionType::VpsReady,
        ConditionStatus::False,
        None,
        None,
        Time(now),
    );
    PhaseOutcome::immediate()
}

fn handle_provisioned(node: &mut Node, now: DateTime<Utc>) -> PhaseOutcome {
    let status = node.status.get_or_insert_with(Default::default);
    status.phase = NodePhase::Joining;
    status.set_condition(
        NodeConditionType::NodeJoined,
        ConditionStatus::False,
        None,
        None,
        Time(now),
    );
    PhaseOutcome::immediate()
}

/// Ready: reflect the bound ClusterNode's readiness; a disappeared
/// ClusterNode flips NodeReady false but never auto-fails the Node.
async fn handle_ready(ctx: &HandlerContext<'_>, node: &mut Node) -> Result<PhaseOutcome, Error> {
    let Some(node_name) = node.status.as_ref().and_then(|s| s.node_name.clone()) else {
        return Ok(PhaseOutcome::after(crate::util::PROBE_INTERVAL));
    };
    let api: Api<k8s_openapi::api::core::v1::Node> = Api::all(ctx.client.clone());
    let ready = match api.get(&node_name).await {
        Ok(cn) => cluster_node_ready(&cn),
        Err(kube::Error::Api(ae)) if ae.code == 404 => false,
        Err(e) => return Err(e.into()),
    };
    let status = node.status.get_or_insert_with(Default::default);
    status.set_condition(
        NodeConditionType::NodeReady,
        ConditionStatus::from_bool(ready),
        None,
        None,
        Time(ctx.now),
    );
    Ok(PhaseOutcome::after(crate::util::PROBE_INTERVAL))
}

fn cluster_node_ready(cn: &k8s_openapi::api::core::v1::Node) -> bool {
    cn.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| {
            cs.iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Failed: idle if TTL disabled; otherwise delete the Node entity once
/// `now - failedAt >= ttl`, where `failedAt` is the Error condition's
/// `lastTransitionTime` (falling back to the object's creation time).
fn handle_failed(node: &mut Node, ttl: Duration, now: DateTime<Utc>) -> PhaseOutcome {
    if ttl.is_zero() {
        return PhaseOutcome::after(crate::util::PROBE_INTERVAL);
    }
    let failed_at = node
        .status
        .as_ref()
        .and_then(|s| s.condition(NodeConditionType::Error))
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0)
        .or_else(|| node.creation_timestamp().map(|t| t.0))
        .unwrap_or(now);

    let elapsed = (now - failed_at).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= ttl {
        PhaseOutcome::delete_now()
    } else {
        PhaseOutcome::after(ttl - elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_types::{NodeStatus, Taint};
    use kube::api::ObjectMeta;

    fn node_with_status(status: NodeStatus) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("n1".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: Some(status),
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn pending_sets_provisioning_and_created_at_once() {
        let mut node = node_with_status(NodeStatus::default());
        let outcome = handle_pending(&mut node, t(100));
        assert_eq!(outcome.requeue_after, Duration::ZERO);
        let status = node.status.as_ref().unwrap();
        assert_eq!(status.phase, NodePhase::Provisioning);
        assert_eq!(status.created_at, Some(Time(t(100))));
        assert!(!status.condition_is_true(NodeConditionType::VpsReady));

        // Re-entering Pending must not move created_at (monotonicity).
        handle_pending(&mut node, t(200));
        assert_eq!(node.status.as_ref().unwrap().created_at, Some(Time(t(100))));
    }

    #[test]
    fn provisioned_transitions_to_joining() {
        let mut status = NodeStatus::default();
        status.phase = NodePhase::Provisioned;
        let mut node = node_with_status(status);
        handle_provisioned(&mut node, t(100));
        assert_eq!(node.status.as_ref().unwrap().phase, NodePhase::Joining);
        assert!(!node.status.as_ref().unwrap().condition_is_true(NodeConditionType::NodeJoined));
    }

    #[test]
    fn failed_ttl_disabled_never_deletes() {
        let mut status = NodeStatus::default();
        status.phase = NodePhase::Failed;
        status.set_condition(
            NodeConditionType::Error,
            ConditionStatus::True,
            None,
            None,
            Time(t(0)),
        );
        let mut node = node_with_status(status);
        let outcome = handle_failed(&mut node, Duration::ZERO, t(1_000_000));
        assert_eq!(outcome.requeue_after, crate::util::PROBE_INTERVAL);
    }

    #[test]
    fn failed_ttl_elapsed_deletes_immediately() {
        let mut status = NodeStatus::default();
        status.set_condition(
            NodeConditionType::Error,
            ConditionStatus::True,
            None,
            None,
            Time(t(0)),
        );
        let mut node = node_with_status(status);
        let outcome = handle_failed(&mut node, Duration::from_secs(1800), t(1801));
        assert_eq!(outcome.requeue_after, Duration::ZERO);
        assert!(outcome.delete);
    }

    #[test]
    fn failed_ttl_not_yet_elapsed_requeues_remaining() {
        let mut status = NodeStatus::default();
        status.set_condition(
            NodeConditionType::Error,
            ConditionStatus::True,
            None,
            None,
            Time(t(0)),
        );
        let mut node = node_with_status(status);
        let outcome = handle_failed(&mut node, Duration::from_secs(1800), t(1000));
        assert_eq!(outcome.requeue_after, Duration::from_secs(800));
    }

    #[test]
    fn cluster_node_ready_reads_ready_condition() {
        use k8s_openapi::api::core::v1::{Node as K8sNode, NodeCondition, NodeStatus as K8sNodeStatus};
        let mut cn = K8sNode::default();
        cn.status = Some(K8sNodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(cluster_node_ready(&cn));
    }

    #[test]
    fn taint_default_is_no_schedule() {
        assert_eq!(Taint::default().effect, autoscaler_types::TaintEffect::NoSchedule);
    }
}
