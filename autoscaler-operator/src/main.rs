mod analyzer;
mod config;
mod iaas;
mod lifecycle;
mod nodegroups;
mod nodes;
mod scaleup;
mod scheduler;
mod util;

use anyhow::Result;
use clap::Parser;
use crate::config::OperatorArgs;
use crate::iaas::IaasClient;
use crate::iaas::client::HttpIaasClient;
use kube::Client;
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    autoscaler_common::init();

    let args = OperatorArgs::parse();
    println!("{}", "🌱 Starting autoscaler-operator...".green());

    let client = Client::try_default().await?;
    let iaas: Arc<dyn IaasClient> = Arc::new(HttpIaasClient::new(
        args.iaas_base_url.clone(),
        args.iaas_api_token.clone(),
    ));
    let lifecycle_config = args.timeouts.to_lifecycle_config();

    autoscaler_common::metrics::maybe_spawn_metrics_server(args.metrics_port);

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        autoscaler_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    autoscaler_common::signal_ready();

    let nodegroups_client = client.clone();
    let nodes_client = client.clone();
    let scaleup_client = client.clone();

    tokio::select! {
        res = nodegroups::reconcile::run(nodegroups_client) => res?,
        res = nodes::reconcile::run(nodes_client, iaas, lifecycle_config) => res?,
        res = scaleup::poll::run(scaleup_client) => res?,
        _ = shutdown.cancelled() => {
            println!("{}", "🛑 Shutdown signal received, exiting.".red());
        }
    }

    Ok(())
}
