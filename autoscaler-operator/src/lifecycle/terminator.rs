//! Terminator (Deleting phase): best-effort IaaS deletion with retry,
//! orchestrated after the Drainer has run.

use super::{HandlerContext, PhaseOutcome};
use crate::lifecycle::drainer;
use crate::util::Error;
use autoscaler_types::{ConditionStatus, Node, NodeConditionType, NodePhase};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_SPACING: Duration = Duration::from_secs(5);

/// Chooses the deletion path: cluster-scoped delete if identifiers are
/// known, else a hostname lookup, else the instance-id delete. A not-found
/// lookup is treated as already-deleted success.
async fn delete_once(ctx: &HandlerContext<'_>, node: &Node) -> Result<(), Error> {
    if let Some(identifier) = node.spec.iaas_node_identifier.as_deref() {
        ctx.iaas
            .delete_cluster_node(&node.spec.cluster_identifier, identifier)
            .await?;
        return Ok(());
    }

    if let Some(hostname) = node.status.as_ref().and_then(|s| s.hostname.as_deref()) {
        let identifier = ctx
            .iaas
            .find_node_identifier(&node.spec.cluster_identifier, hostname)
            .await?;
        if identifier.is_empty() {
            return Ok(());
        }
        ctx.iaas
            .delete_cluster_node(&node.spec.cluster_identifier, &identifier)
            .await?;
        return Ok(());
    }

    if node.spec.iaas_instance_id != 0 {
        ctx.iaas.delete_node(node.spec.iaas_instance_id).await?;
    }
    Ok(())
}

pub async fn handle(ctx: &HandlerContext<'_>, node: &mut Node) -> Result<PhaseOutcome, Error> {
    if let Some(node_name) = node.status.as_ref().and_then(|s| s.node_name.clone()) {
        let _ = drainer::delete_cluster_node(ctx.client.clone(), &node_name).await;
    }

    let mut last_err: Option<Error> = None;
    for attempt in 0..MAX_ATTEMPTS {
        match delete_once(ctx, node).await {
            Ok(()) => {
                node.status.get_or_insert_with(Default::default).deleted_at = Some(Time(ctx.now));
                return Ok(PhaseOutcome::immediate());
            }
            Err(e) if e.is_terminal() => {
                last_err = Some(e);
                break;
            }
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(RETRY_SPACING).await;
                }
            }
        }
    }

    let status = node.status.get_or_insert_with(Default::default);
    status.phase = NodePhase::Failed;
    let message = format!(
        "Failed to delete VPS: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    );
    status.last_error = Some(message.clone());
    status.set_condition(
        NodeConditionType::Error,
        ConditionStatus::True,
        Some("VPSDeleteFailed".to_string()),
        Some(message),
        Time(ctx.now),
    );
    Ok(PhaseOutcome::immediate())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_and_spacing_match_spec() {
        assert_eq!(MAX_ATTEMPTS, 3);
        assert_eq!(RETRY_SPACING, Duration::from_secs(5));
    }
}
