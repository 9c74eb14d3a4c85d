//! Scale-up polling loop: periodically refreshes the [`SchedulerWatcher`]
//! from the live cluster, runs the ResourceAnalyzer/ScaleUpController
//! pipeline for every matched NodeGroup, and executes any scale decisions.
//! Runs under its own leader-election lease, the same lease-acquire/renew
//! skeleton the NodeGroup/Node controllers use for their `Controller::run`
//! loops, generalized here to a plain tick loop since this isn't a
//! `kube::runtime` watch-driven reconciler.

use super::{ScaleOutcome, decide_scale_up, execute};
use crate::analyzer::{self, InstanceInfo};
use crate::scheduler::{SchedulerWatcher, convert};
use crate::util::Error;
use autoscaler_types::{Node, NodeGroup};
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Client, ResourceExt,
    api::{Api, ListParams},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Derives an [`InstanceInfo`] for a NodeGroup from the resources reported
/// by any `Node` it currently owns. New NodeGroups with no Node that has
/// ever reported resources cannot be sized yet; scale-up for them is
/// skipped until at least one Node has joined and reported.
fn instance_info_for(group: &NodeGroup, nodes: &[Node]) -> Option<InstanceInfo> {
    nodes
        .iter()
        .filter(|n| n.spec.node_group_name == group.name_any())
        .find_map(|n| {
            let resources = &n.status.as_ref()?.resources;
            let cpu = resources.cpu?;
            let mem_mb = resources.mem_mb?;
            Some(InstanceInfo {
                cpu_millicores: cpu as u64 * 1000,
                memory_bytes: mem_mb * 1024 * 1024,
            })
        })
}

async fn refresh(client: &Client, namespace: &str, watcher: &SchedulerWatcher) -> Result<(), Error> {
    let pods_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pods = pods_api.list(&ListParams::default()).await?.items;
    let pending = pods.iter().filter_map(convert::pending_pod_from).collect();
    watcher.set_pending_pods(pending);

    let groups_api: Api<NodeGroup> = Api::namespaced(client.clone(), namespace);
    let groups = groups_api.list(&ListParams::default()).await?.items;
    watcher.set_node_groups(groups);
    Ok(())
}

async fn tick(client: &Client, namespace: &str, watcher: &SchedulerWatcher) -> Result<(), Error> {
    refresh(client, namespace, watcher).await?;

    let pods = watcher.pending_pods();
    let groups = watcher.node_groups();
    let nodes_api: Api<Node> = Api::namespaced(client.clone(), namespace);
    let nodes = nodes_api.list(&ListParams::default()).await?.items;

    let matches = analyzer::find_matching_node_groups(&pods, &groups);
    let now = Utc::now();

    for m in matches {
        let group = &m.node_group;
        let Some(group_name) = group.metadata.name.as_deref() else {
            continue;
        };
        let group_namespace = group.metadata.namespace.as_deref().unwrap_or(namespace);

        let Some(instance) = instance_info_for(group, &nodes) else {
            continue;
        };

        let can_scale = watcher.can_scale(
            group_namespace,
            group_name,
            now,
            Duration::from_secs(group.spec.scale_cooldown_seconds as u64),
        );

        let needed = analyzer::estimate_nodes_needed(&m.deficit, &instance, group.spec.max_pods_per_node);
        let current = group.status.as_ref().map(|s| s.current_nodes).unwrap_or(0);
        let desired = group.status.as_ref().map(|s| s.desired_nodes).unwrap_or(0);

        let outcome = decide_scale_up(
            group_name,
            group_namespace,
            &group.spec.instance_type,
            group.spec.max_nodes,
            current,
            desired,
            needed,
            can_scale,
        );

        if let ScaleOutcome::Decided(decision) = outcome {
            println!(
                "{} {}/{}: {} -> {}",
                "📈 scaling up".green(),
                decision.namespace,
                decision.node_group,
                decision.from,
                decision.to,
            );
            execute(client.clone(), watcher, &decision, now).await?;
        }
    }

    Ok(())
}

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting scale-up controller...".green());

    let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("autoscaler-scaleup-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "autoscaler-scaleup-controller-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let watcher = Arc::new(SchedulerWatcher::new());
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        autoscaler_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    let mut poll_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut renew_tick = interval(renew_every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = poll_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = renew_tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = poll_task.take() {
                    task.abort();
                    eprintln!("aborted scale-up controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if poll_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting scale-up poll loop".green());
                let client = client.clone();
                let namespace = namespace.clone();
                let watcher = watcher.clone();
                poll_task = Some(tokio::spawn(async move {
                    let mut poll_tick = interval(POLL_INTERVAL);
                    loop {
                        poll_tick.tick().await;
                        if let Err(e) = tick(&client, &namespace, &watcher).await {
                            eprintln!("{}", format!("scale-up tick failed: {e}").red());
                        }
                    }
                }));
            }
        } else if let Some(task) = poll_task.take() {
            eprintln!("lost leadership; stopping scale-up poll loop");
            task.abort();
        }
    }
}
