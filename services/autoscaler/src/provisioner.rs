//! Spot worker provisioning.
//!
//! Assigns a unique worker name, builds the full instance creation request,
//! submits it, and waits for the zone operation to finish. The request shape
//! is fixed policy: a spot VM with a bounded lifetime that deletes itself on
//! preemption, so every worker is disposable by construction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::compute::{
    AccessConfig, AttachedDisk, ComputeApi, ComputeError, InitializeParams, InstanceResource,
    MaxRunDuration, Metadata, MetadataItem, NetworkInterface, Scheduling, ServiceAccount, Tags,
};
use crate::config::Config;
use crate::supply::WORKER_TAG;

/// Prefix for generated worker names.
const WORKER_NAME_PREFIX: &str = "worker";

/// Boot disk size in GB.
const BOOT_DISK_GB: i64 = 300;

/// Workers are reaped after this long regardless of activity.
const MAX_RUN_DURATION: Duration = Duration::from_secs(8 * 3600);

/// Seconds of idleness after which an unattended worker shuts itself down.
const IDLE_SHUTDOWN_SECS: u32 = 300;

/// Metadata key the worker image reads its idle-shutdown timeout from.
const IDLE_SHUTDOWN_KEY: &str = "buildkite-idle-shutdown-time";

/// OAuth scopes granted to the worker's service account.
const WORKER_SCOPES: [&str; 4] = [
    "https://www.googleapis.com/auth/logging.write",
    "https://www.googleapis.com/auth/monitoring.write",
    "https://www.googleapis.com/auth/compute",
    "https://www.googleapis.com/auth/devstorage.read_write",
];

/// Process-local source of unique worker numbers.
///
/// `next = max(last + 1, now)`: strictly increasing within a process even if
/// the wall clock skews backward, and seeded from wall-clock time to reduce
/// collision risk across process restarts.
#[derive(Debug, Default)]
struct NameCounter {
    last: i64,
}

impl NameCounter {
    fn next(&mut self, now_unix: i64) -> i64 {
        self.last = (self.last + 1).max(now_unix);
        self.last
    }
}

/// A successfully provisioned worker.
#[derive(Debug, Clone)]
pub struct ProvisionedWorker {
    pub name: String,
    pub zone: String,
}

/// Provisions one spot worker at a time.
pub struct InstanceProvisioner<C> {
    compute: Arc<C>,
    config: Config,
    counter: NameCounter,
}

impl<C: ComputeApi> InstanceProvisioner<C> {
    /// Create a new provisioner.
    pub fn new(compute: Arc<C>, config: Config) -> Self {
        Self {
            compute,
            config,
            counter: NameCounter::default(),
        }
    }

    /// Provision one spot worker and wait for the insert to finish.
    ///
    /// The operation wait surfaces insert-time failures (quota exhaustion,
    /// missing image) as errors instead of assuming success on submission.
    pub async fn provision(&mut self) -> Result<ProvisionedWorker, ComputeError> {
        let number = self.counter.next(Utc::now().timestamp());
        let name = format!("{WORKER_NAME_PREFIX}-{number}");
        let zone = self.config.provision_zone();
        let request = build_insert_request(&self.config, &name);

        info!(
            name = %name,
            zone = %zone,
            machine_type = %self.config.machine_type,
            image = %self.config.image_name,
            "Provisioning spot worker"
        );

        let operation = self.compute.insert_instance(&zone, &request).await?;
        self.compute.wait_operation(&zone, &operation.name).await?;

        info!(name = %name, zone = %zone, "Worker provisioned");
        Ok(ProvisionedWorker { name, zone })
    }
}

/// Build the full insert body for one spot worker.
///
/// Fully determined by configuration plus the generated name.
pub fn build_insert_request(config: &Config, name: &str) -> InstanceResource {
    let zone = config.provision_zone();
    let project = &config.project_id;

    InstanceResource {
        name: name.to_string(),
        machine_type: format!("zones/{zone}/machineTypes/{}", config.machine_type),
        disks: vec![AttachedDisk {
            auto_delete: true,
            boot: true,
            disk_kind: "PERSISTENT".to_string(),
            initialize_params: InitializeParams {
                disk_size_gb: BOOT_DISK_GB.to_string(),
                disk_type: format!("zones/{zone}/diskTypes/pd-ssd"),
                source_image: format!("projects/{project}/global/images/{}", config.image_name),
            },
        }],
        network_interfaces: vec![NetworkInterface {
            network: "global/networks/default".to_string(),
            subnetwork: format!("projects/{project}/regions/{}/subnetworks/ipv6", config.region),
            stack_type: "IPV4_ONLY".to_string(),
            access_configs: vec![AccessConfig {
                name: "External NAT".to_string(),
                network_tier: "STANDARD".to_string(),
            }],
        }],
        scheduling: Scheduling {
            automatic_restart: false,
            provisioning_model: "SPOT".to_string(),
            instance_termination_action: "DELETE".to_string(),
            on_host_maintenance: "TERMINATE".to_string(),
            max_run_duration: MaxRunDuration {
                seconds: MAX_RUN_DURATION.as_secs().to_string(),
            },
        },
        service_accounts: vec![ServiceAccount {
            email: config.service_account.clone(),
            scopes: WORKER_SCOPES.iter().map(|s| s.to_string()).collect(),
        }],
        metadata: Metadata {
            items: vec![MetadataItem {
                key: IDLE_SHUTDOWN_KEY.to_string(),
                value: IDLE_SHUTDOWN_SECS.to_string(),
            }],
        },
        tags: Tags {
            items: vec![
                "ssh".to_string(),
                "icmp".to_string(),
                WORKER_TAG.to_string(),
            ],
        },
    }
}
