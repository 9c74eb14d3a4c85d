//! Provisioner (Provisioning phase): translates NodeGroup intent into
//! IaaS create calls, polls IaaS status, and normalizes the result onto
//! the Node.

use super::{HandlerContext, PhaseOutcome};
use crate::util::Error;
use autoscaler_common::annotations;
use autoscaler_types::{ConditionStatus, Node, NodeConditionType, NodePhase, NodeResources};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

fn provisioning_timed_out(created_at: Option<Time>, now: DateTime<Utc>, timeout: Duration) -> bool {
    match created_at {
        None => false,
        Some(t) => (now - t.0).to_std().map(|d| d > timeout).unwrap_or(false),
    }
}

fn fail(node: &mut Node, reason: &str, message: String, now: DateTime<Utc>) -> PhaseOutcome {
    let status = node.status.get_or_insert_with(Default::default);
    status.phase = NodePhase::Failed;
    status.last_error = Some(message.clone());
    status.set_condition(
        NodeConditionType::Error,
        ConditionStatus::True,
        Some(reason.to_string()),
        Some(message),
        Time(now),
    );
    PhaseOutcome::immediate()
}

pub async fn handle(ctx: &HandlerContext<'_>, node: &mut Node) -> Result<PhaseOutcome, Error> {
    let created_at = node.status.as_ref().and_then(|s| s.created_at.clone());
    if provisioning_timed_out(created_at, ctx.now, ctx.config.provisioning_timeout) {
        return Ok(fail(
            node,
            "ProvisioningTimeout",
            "provisioning timeout exceeded".to_string(),
            ctx.now,
        ));
    }

    let instance_id = node.spec.iaas_instance_id;
    if instance_id != 0 {
        return poll(ctx, node, instance_id).await;
    }

    let creation_requested = node
        .annotations()
        .get(annotations::CREATION_REQUESTED)
        .map(String::as_str)
        == Some("true");

    if creation_requested {
        return super::discoverer::handle(ctx, node).await;
    }

    create(ctx, node).await
}

async fn create(ctx: &HandlerContext<'_>, node: &mut Node) -> Result<PhaseOutcome, Error> {
    let result = ctx
        .iaas
        .create_node(&node.spec.cluster_identifier, node.spec.external_group_id)
        .await;

    match result {
        Ok(vm) if vm.id != 0 => {
            node.spec.iaas_instance_id = vm.id;
            node.spec.ip_address = vm.ip.clone();
            node.spec.ipv6_address = vm.ipv6.clone();
            let status = node.status.get_or_insert_with(Default::default);
            status.hostname = Some(vm.hostname);
            status.iaas_status = vm.status;
            status.resources = NodeResources {
                cpu: vm.cpu,
                mem_mb: vm.ram_mb,
                disk_gb: vm.disk_gb,
            };
            Ok(PhaseOutcome::after(POLL_INTERVAL))
        }
        Ok(_deferred) => {
            node.annotations_mut()
                .insert(annotations::CREATION_REQUESTED.to_string(), "true".to_string());
            let status = node.status.get_or_insert_with(Default::default);
            status.iaas_status = Some("provisioning".to_string());
            Ok(PhaseOutcome::after(POLL_INTERVAL))
        }
        Err(e) if e.is_terminal() => Ok(fail(node, "CapacityLimitReached", e.to_string(), ctx.now)),
        Err(e) => {
            let status = node.status.get_or_insert_with(Default::default);
            status.last_error = Some(e.to_string());
            Ok(PhaseOutcome::after(crate::util::PROBE_INTERVAL))
        }
    }
}

async fn poll(ctx: &HandlerContext<'_>, node: &mut Node, instance_id: u64) -> Result<PhaseOutcome, Error> {
    match ctx.iaas.get_node(instance_id).await {
        Ok(Some(vm)) if vm.status.as_deref() == Some("running") => {
            let status = node.status.get_or_insert_with(Default::default);
            status.phase = NodePhase::Provisioned;
            if status.provisioned_at.is_none() {
                status.provisioned_at = Some(Time(ctx.now));
            }
            status.set_condition(
                NodeConditionType::VpsReady,
                ConditionStatus::True,
                None,
                None,
                Time(ctx.now),
            );
            Ok(PhaseOutcome::immediate())
        }
        Ok(None) => Ok(fail(node, "VPSNotFound", "VPS not found".to_string(), ctx.now)),
        Ok(Some(_not_ready)) => Ok(PhaseOutcome::after(POLL_INTERVAL)),
        Err(e) if e.is_terminal() => Ok(fail(node, "CapacityLimitReached", e.to_string(), ctx.now)),
        Err(e) => {
            let status = node.status.get_or_insert_with(Default::default);
            status.last_error = Some(e.to_string());
            Ok(PhaseOutcome::after(crate::util::PROBE_INTERVAL))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn no_created_at_never_times_out() {
        assert!(!provisioning_timed_out(None, t(100_000), Duration::from_secs(600)));
    }

    #[test]
    fn exceeds_ten_minute_default_timeout() {
        let created = Some(Time(t(0)));
        assert!(provisioning_timed_out(created, t(11 * 60), Duration::from_secs(600)));
        assert!(!provisioning_timed_out(created, t(9 * 60), Duration::from_secs(600)));
    }
}
