//! Configuration for the autoscaler.
//!
//! Every option is read once at startup (flag or environment variable) and
//! is immutable for the process lifetime.

use clap::Parser;

/// Autoscaler configuration.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "autoscaler",
    about = "Scales ephemeral Buildkite spot workers on GCE to match queue demand"
)]
pub struct Config {
    /// Buildkite agent API token.
    #[arg(long, env = "BUILDKITE_AGENT_TOKEN", hide_env_values = true)]
    pub agent_token: String,

    /// Buildkite queue to autoscale.
    #[arg(long, default_value = "default")]
    pub queue: String,

    /// Buildkite project to monitor.
    #[arg(long, default_value = "ci")]
    pub buildkite_project: String,

    /// Buildkite organization slug to filter events for.
    #[arg(long)]
    pub organization: String,

    /// Service account email new workers run as.
    #[arg(long)]
    pub service_account: String,

    /// GCP project ID.
    #[arg(long, env = "SPOTSCALE_PROJECT_ID")]
    pub project_id: String,

    /// GCP region.
    #[arg(long, default_value = "us-west1")]
    pub region: String,

    /// Zone suffix within the region new workers are provisioned into.
    #[arg(long, default_value = "b")]
    pub zone: String,

    /// Zone suffixes scanned when counting live workers.
    #[arg(long, value_delimiter = ',', default_value = "a,b,c")]
    pub scan_zones: Vec<String>,

    /// GCE machine type for new workers.
    #[arg(long, default_value = "c3-standard-4")]
    pub machine_type: String,

    /// GCE image new workers boot from.
    #[arg(long, default_value = "buildkite-agent")]
    pub image_name: String,

    /// Maximum number of concurrently provisioned workers.
    #[arg(long, default_value_t = 4)]
    pub max_instances: u32,

    /// Buildkite agent API base URL.
    #[arg(
        long,
        env = "BUILDKITE_AGENT_API_URL",
        default_value = "https://agent.buildkite.com/v3"
    )]
    pub buildkite_api_url: String,

    /// GCE compute API base URL.
    #[arg(
        long,
        env = "COMPUTE_API_URL",
        default_value = "https://compute.googleapis.com/compute/v1"
    )]
    pub compute_api_url: String,

    /// OAuth access token for the compute API.
    #[arg(long, env = "COMPUTE_ACCESS_TOKEN", hide_env_values = true)]
    pub compute_token: Option<String>,

    /// List current inventory across the scan zones and exit.
    #[arg(long)]
    pub print_inventory: bool,
}

impl Config {
    /// Zone new workers are provisioned into.
    pub fn provision_zone(&self) -> String {
        format!("{}-{}", self.region, self.zone)
    }

    /// Zones scanned for live workers, derived from the configured region
    /// so supply accounting can never drift from the provisioning region.
    pub fn supply_zones(&self) -> Vec<String> {
        self.scan_zones
            .iter()
            .map(|suffix| format!("{}-{}", self.region, suffix))
            .collect()
    }
}
