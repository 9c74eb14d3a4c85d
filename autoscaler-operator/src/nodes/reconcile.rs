//! NodeReconciler: the per-object reconcile loop driving a `Node` through
//! the lifecycle state machine, with finalizer-gated deletion so the
//! Terminator/Drainer get a chance to run before the API server removes
//! the object.

use crate::iaas::IaasClient;
use crate::lifecycle::{self, HandlerContext, LifecycleConfig};
use crate::util::{
    self, Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};
use autoscaler_types::{ConditionStatus, Node, NodeConditionType};
use chrono::Utc;
use futures::stream::StreamExt;
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        Controller,
        controller::Action,
        finalizer::{Event, finalizer},
    },
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

const FINALIZER: &str = "autoscaler.vpsie.io/node-cleanup";

pub async fn run(client: Client, iaas: Arc<dyn IaasClient>, config: LifecycleConfig) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Node controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), iaas, config));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("autoscaler-node-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "autoscaler-node-controller-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        autoscaler_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted Node controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting Node controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let namespace = lease_namespace.clone();
                let api: Api<Node> = Api::namespaced(client_for_controller, &namespace);
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Node controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    iaas: Arc<dyn IaasClient>,
    config: LifecycleConfig,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    fn new(client: Client, iaas: Arc<dyn IaasClient>, config: LifecycleConfig) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                iaas,
                config,
                metrics: ControllerMetrics::new("nodes"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client, iaas, config }
        }
    }
}

async fn reconcile(node: Arc<Node>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = node
        .namespace()
        .ok_or_else(|| Error::UserInput("Node must be namespaced".to_string()))?;
    let api: Api<Node> = Api::namespaced(client.clone(), &namespace);

    finalizer(&api, FINALIZER, node, |event| async {
        match event {
            Event::Apply(node) => apply(&context, &node).await,
            Event::Cleanup(node) => cleanup(&context, &node).await,
        }
    })
    .await
    .map_err(|e| Error::UserInput(format!("finalizer error: {e}")))
}

async fn apply(context: &ContextData, node: &Node) -> Result<Action, Error> {
    let client = context.client.clone();
    let name = node.name_any();
    let namespace = node.namespace().unwrap_or_default();
    let now = Utc::now();

    let mut working = node.clone();
    if working.status.is_none() {
        let status = working.status.get_or_insert_with(Default::default);
        status.observed_generation = node.meta().generation.unwrap_or(0);
    }
    if working
        .status
        .as_ref()
        .is_some_and(|s| s.condition_is_true(NodeConditionType::Error))
        && working.status.as_ref().map(|s| s.phase).unwrap_or_default() != autoscaler_types::NodePhase::Failed
    {
        working.status.as_mut().unwrap().set_condition(
            NodeConditionType::Error,
            ConditionStatus::False,
            None,
            None,
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now),
        );
    }

    let ctx = HandlerContext {
        client: client.clone(),
        iaas: context.iaas.clone(),
        config: &context.config,
        now,
    };
    let outcome = lifecycle::handle(&ctx, &mut working).await?;

    let old_phase = node.status.as_ref().map(|s| s.phase).unwrap_or_default();
    let new_phase = working.status.as_ref().map(|s| s.phase).unwrap_or_default();
    if old_phase != new_phase {
        println!(
            "{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            format!(" {:?} -> {:?}", old_phase, new_phase).color(FG1),
        );
    }

    #[cfg(feature = "metrics")]
    {
        context.metrics.record_reconcile(&name, &namespace);
        let phase = format!("{:?}", working.status.as_ref().map(|s| s.phase).unwrap_or_default());
        context.metrics.record_action(&name, &namespace, &phase);
    }

    if working.spec != node.spec {
        util::patch::patch_spec(client.clone(), node, working.clone()).await?;
    }

    match util::patch::patch_status::<autoscaler_types::NodeStatus, Node>(client.clone(), node, |status| {
        if let Some(new_status) = working.status.clone() {
            *status = new_status;
        }
    })
    .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => return Ok(Action::requeue(Duration::from_secs(1))),
        Err(e) => return Err(e.into()),
    }

    if outcome.delete {
        let api: Api<Node> = Api::namespaced(client.clone(), &namespace);
        match api.delete(&name, &kube::api::DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(Action::await_change());
    }

    if outcome.requeue_after.is_zero() {
        Ok(Action::requeue(Duration::from_secs(1)))
    } else {
        Ok(Action::requeue(outcome.requeue_after.max(PROBE_INTERVAL.min(outcome.requeue_after))))
    }
}

/// The `kube` finalizer helper strips our finalizer the moment this
/// returns `Ok`, so drain and terminate must both run to completion here
/// rather than across separate reconciles — there is no second chance
/// once the object is gone. Both steps are already internally bounded
/// (the Drainer's 120s best-effort timeout, the Terminator's fixed
/// 3-attempt retry), so this is a bounded blocking call, not an
/// unbounded one.
async fn cleanup(context: &ContextData, node: &Node) -> Result<Action, Error> {
    let client = context.client.clone();
    let now = Utc::now();
    let mut working = node.clone();
    {
        let status = working.status.get_or_insert_with(Default::default);
        if status.terminating_at.is_none() {
            status.terminating_at = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now));
        }
        status.phase = autoscaler_types::NodePhase::Terminating;
    }

    let ctx = HandlerContext {
        client: client.clone(),
        iaas: context.iaas.clone(),
        config: &context.config,
        now,
    };

    let _ = lifecycle::drainer::handle(&ctx, &mut working).await;
    let _ = lifecycle::terminator::handle(&ctx, &mut working).await;

    match util::patch::patch_status::<autoscaler_types::NodeStatus, Node>(client, node, |status| {
        if let Some(new_status) = working.status.clone() {
            *status = new_status;
        }
    })
    .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {}
        Err(e) => eprintln!("failed to persist status before cleanup finalizer removal: {e}"),
    }

    Ok(Action::await_change())
}

fn on_error(node: Arc<Node>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Node reconciliation error: {:?} {:?}", error, node.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}
