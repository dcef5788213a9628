//! The reconciliation control loop.
//!
//! One self-looping cycle, no concurrent cycles:
//! sample -> (skip-check) -> [count] -> [provision -> wait] -> sleep.
//!
//! Sampling failures and transient cloud errors back off and retry;
//! permanent cloud errors propagate and terminate the loop.

use std::sync::Arc;
use std::time::Duration;

use spotscale_policy::{decide, Decision, SkipReason};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::buildkite::BuildkiteClient;
use crate::compute::{ComputeApi, ComputeError};
use crate::config::Config;
use crate::provisioner::InstanceProvisioner;
use crate::supply::{SupplyAccountant, WORKER_TAG};

/// Sleep applied after a failed cycle before sampling again.
const FALLBACK_INTERVAL: Duration = Duration::from_secs(100);

/// Drives reconciliation cycles against the queue and the cloud.
pub struct Autoscaler<C> {
    buildkite: BuildkiteClient,
    accountant: SupplyAccountant<C>,
    provisioner: InstanceProvisioner<C>,
    max_instances: u32,
}

impl<C: ComputeApi> Autoscaler<C> {
    /// Create a new autoscaler on top of a compute client.
    pub fn new(config: &Config, compute: Arc<C>) -> Self {
        Self {
            buildkite: BuildkiteClient::new(config),
            accountant: SupplyAccountant::new(
                Arc::clone(&compute),
                config.supply_zones(),
                WORKER_TAG,
            ),
            provisioner: InstanceProvisioner::new(compute, config.clone()),
            max_instances: config.max_instances,
        }
    }

    /// Run reconciliation cycles until shutdown is signaled.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ComputeError> {
        info!(max_instances = self.max_instances, "Starting autoscaler loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(delay) => delay,
                Err(e) if e.is_permanent() => {
                    error!(error = %e, "Permanent provisioning failure, giving up");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Cycle failed, backing off");
                    FALLBACK_INTERVAL
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Autoscaler shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// One cycle: sample, decide, provision at most one worker.
    ///
    /// Returns how long to sleep before the next cycle; on success that is
    /// the queue's reported poll interval, so the queue service controls
    /// polling cadence.
    pub async fn run_cycle(&mut self) -> Result<Duration, ComputeError> {
        let metrics = match self.buildkite.get_metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "Failed to sample queue metrics");
                return Ok(FALLBACK_INTERVAL);
            }
        };

        info!(
            scheduled_jobs = metrics.scheduled_jobs,
            running_jobs = metrics.running_jobs,
            waiting_jobs = metrics.waiting_jobs,
            idle_agents = metrics.idle_agents,
            busy_agents = metrics.busy_agents,
            total_agents = metrics.total_agents,
            "Sampled queue metrics"
        );

        match decide(&metrics, self.max_instances, &self.accountant).await? {
            Decision::Provision { desired, supply } => {
                info!(desired, supply, "Not enough workers, starting one");
                let worker = self.provisioner.provision().await?;
                info!(name = %worker.name, zone = %worker.zone, "Started worker");
            }
            Decision::Skip(reason) => log_skip(reason),
        }

        Ok(metrics.poll_interval)
    }
}

fn log_skip(reason: SkipReason) {
    match reason {
        SkipReason::QueueSatisfied {
            desired,
            total_agents,
        } => {
            debug!(desired, total_agents, "Queue capacity sufficient");
        }
        SkipReason::NoDeficit { desired, supply } => {
            debug!(desired, supply, "Live workers cover demand");
        }
        SkipReason::CeilingReached { supply, ceiling } => {
            info!(supply, ceiling, "Instance ceiling reached, not provisioning");
        }
    }
}
