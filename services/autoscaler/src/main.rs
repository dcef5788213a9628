//! spotscale autoscaler
//!
//! Keeps a pool of ephemeral spot workers sized to a Buildkite queue's
//! pending work. Each cycle samples queue metrics, counts tagged workers
//! across the region's zones, and provisions at most one spot worker while
//! under the configured ceiling. Scale-down is the workers' own job: every
//! instance carries an idle-shutdown timeout and a bounded max run duration.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spotscale_autoscaler::compute::ComputeApi;
use spotscale_autoscaler::{Autoscaler, ComputeClient, Config, WORKER_TAG};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::parse();
    info!(
        organization = %config.organization,
        buildkite_project = %config.buildkite_project,
        queue = %config.queue,
        project_id = %config.project_id,
        region = %config.region,
        zone = %config.provision_zone(),
        max_instances = config.max_instances,
        "Starting spotscale autoscaler"
    );

    let compute = Arc::new(ComputeClient::new(&config));

    if config.print_inventory {
        return print_inventory(&config, compute.as_ref()).await;
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut autoscaler = Autoscaler::new(&config, compute);
    let mut loop_handle = tokio::spawn(async move { autoscaler.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut loop_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Autoscaler failed");
                    Err(e.into())
                }
                Err(e) => Err(anyhow::anyhow!("autoscaler task panicked: {e}")),
            };
        }
    }

    // Signal shutdown and let the loop wind down
    let _ = shutdown_tx.send(true);
    match loop_handle.await {
        Ok(Ok(())) => info!("Autoscaler shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "Autoscaler failed during shutdown"),
        Err(e) => error!(error = %e, "Autoscaler task panicked"),
    }

    Ok(())
}

/// Dump the current inventory across the scan zones and exit.
async fn print_inventory<C: ComputeApi>(config: &Config, compute: &C) -> Result<()> {
    for zone in config.supply_zones() {
        for instance in compute.list_instances(&zone).await? {
            info!(
                zone = %zone,
                name = %instance.name,
                status = %instance.status,
                tags = ?instance.tags.items,
                worker = instance.has_tag(WORKER_TAG),
                "Instance"
            );
        }
    }
    Ok(())
}
