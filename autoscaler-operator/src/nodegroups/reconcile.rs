//! Entrypoint and reconcile loop for the NodeGroup materializer.

use super::{count_owned_nodes, generate_node_name, nodes_to_create};
use crate::util::{
    self, Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};
use autoscaler_common::labels;
use autoscaler_types::{Node, NodeGroup, NodeGroupStatus, NodeSpec};
use futures::stream::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource},
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting NodeGroup controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("autoscaler-nodegroup-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "autoscaler-nodegroup-controller-lock".to_string();
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
                    eprintln!("aborted NodeGroup controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting NodeGroup controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let namespace = lease_namespace.clone();
                let api: Api<NodeGroup> = Api::namespaced(client_for_controller.clone(), &namespace);
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(api, Default::default())
                        .owns(Api::<Node>::namespaced(client_for_controller, &namespace), Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping NodeGroup controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    fn new(client: Client) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                metrics: ControllerMetrics::new("nodegroups"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client }
        }
    }
}

async fn reconcile(group: Arc<NodeGroup>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = group
        .namespace()
        .ok_or_else(|| Error::UserInput("NodeGroup must be namespaced".to_string()))?;
    let name = group.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.record_reconcile(&name, &namespace);

    let nodes_api: Api<Node> = Api::namespaced(client.clone(), &namespace);
    let owned = nodes_api
        .list(&ListParams::default().labels(&format!("{}={}", labels::NODE_GROUP, name)))
        .await?
        .items;

    let counts = count_owned_nodes(&group, &owned);
    let shortfall = nodes_to_create(&group, counts.current);

    if shortfall > 0 {
        println!(
            "{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            format!(" materializing {shortfall} Node(s)").color(FG1),
        );
        #[cfg(feature = "metrics")]
        context.metrics.record_action(&name, &namespace, "CreateNodes");
        for _ in 0..shortfall {
            create_node(&client, &namespace, &group).await?;
        }
    }

    let (current, ready) = if shortfall > 0 {
        (counts.current + shortfall, counts.ready)
    } else {
        (counts.current, counts.ready)
    };

    let patch = Patch::Merge(serde_json::json!({
        "status": NodeGroupStatus {
            current_nodes: current,
            ready_nodes: ready,
            desired_nodes: group.status.as_ref().map(|s| s.desired_nodes).unwrap_or(0),
            last_scale_time: group.status.as_ref().and_then(|s| s.last_scale_time.clone()),
        }
    }));
    let api: Api<NodeGroup> = Api::namespaced(client, &namespace);
    match api
        .patch_status(&name, &PatchParams::apply(util::MANAGER_NAME), &patch)
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => return Ok(Action::requeue(Duration::from_secs(1))),
        Err(e) => return Err(e.into()),
    }

    Ok(Action::requeue(PROBE_INTERVAL))
}

async fn create_node(client: &Client, namespace: &str, group: &NodeGroup) -> Result<(), Error> {
    let name = generate_node_name(group);
    let mut node_labels = std::collections::BTreeMap::new();
    node_labels.insert(labels::MANAGED.to_string(), "true".to_string());
    node_labels.insert(labels::NODE_GROUP.to_string(), group.name_any());
    node_labels.insert(labels::DATACENTER.to_string(), group.spec.datacenter.clone());

    let node = Node {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(node_labels),
            owner_references: Some(vec![group.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: NodeSpec {
            instance_type: group.spec.instance_type.clone(),
            node_group_name: group.name_any(),
            datacenter: group.spec.datacenter.clone(),
            cluster_identifier: group.spec.cluster_identifier.clone(),
            external_group_id: group.spec.external_group_id,
            ..Default::default()
        },
        status: None,
    };

    let api: Api<Node> = Api::namespaced(client.clone(), namespace);
    match api.create(&PostParams::default(), &node).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn on_error(group: Arc<NodeGroup>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("NodeGroup reconciliation error: {:?} {:?}", error, group.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}
