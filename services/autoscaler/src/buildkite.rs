//! Buildkite agent metrics client.
//!
//! Samples queue demand from the agent metrics endpoint. The response covers
//! the whole organization; per-queue counts come from the `queues` maps.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use spotscale_policy::QueueMetrics;
use tracing::debug;

use crate::config::Config;

/// Polling cadence applied when the API omits one.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Buildkite agent API client.
pub struct BuildkiteClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    queue: String,
}

impl BuildkiteClient {
    /// Create a new Buildkite client from configuration.
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.buildkite_api_url.trim_end_matches('/').to_string(),
            token: config.agent_token.clone(),
            queue: config.queue.clone(),
        }
    }

    /// Sample current metrics for the configured queue.
    ///
    /// Read-only; any transport or auth failure is recoverable and the
    /// control loop retries after a fallback sleep.
    pub async fn get_metrics(&self) -> Result<QueueMetrics> {
        let url = format!("{}/metrics", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Token {}", self.token))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("metrics request failed: {} - {}", status, body);
        }

        let payload: MetricsResponse = response.json().await?;
        debug!(
            organization = %payload.organization.slug,
            queue = %self.queue,
            "Fetched agent metrics"
        );

        Ok(payload.for_queue(&self.queue))
    }
}

/// Agent metrics response.
#[derive(Debug, Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    organization: Organization,
    #[serde(default)]
    jobs: JobTotals,
    #[serde(default)]
    agents: AgentTotals,
    #[serde(default)]
    polling: Option<Polling>,
}

#[derive(Debug, Default, Deserialize)]
struct Organization {
    #[serde(default)]
    slug: String,
}

#[derive(Debug, Default, Deserialize)]
struct JobTotals {
    #[serde(default)]
    queues: HashMap<String, JobCounts>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct JobCounts {
    #[serde(default)]
    scheduled: u32,
    #[serde(default)]
    running: u32,
    #[serde(default)]
    waiting: u32,
}

#[derive(Debug, Default, Deserialize)]
struct AgentTotals {
    #[serde(default)]
    queues: HashMap<String, AgentCounts>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct AgentCounts {
    #[serde(default)]
    idle: u32,
    #[serde(default)]
    busy: u32,
    #[serde(default)]
    total: u32,
}

#[derive(Debug, Deserialize)]
struct Polling {
    interval: u64,
}

impl MetricsResponse {
    /// Narrow organization-wide metrics to one queue.
    ///
    /// A queue absent from the maps has no agents or jobs yet and yields
    /// zero counts.
    fn for_queue(&self, queue: &str) -> QueueMetrics {
        let jobs = self.jobs.queues.get(queue).copied().unwrap_or_default();
        let agents = self.agents.queues.get(queue).copied().unwrap_or_default();

        QueueMetrics {
            scheduled_jobs: jobs.scheduled,
            running_jobs: jobs.running,
            waiting_jobs: jobs.waiting,
            idle_agents: agents.idle,
            busy_agents: agents.busy,
            total_agents: agents.total,
            poll_interval: self
                .polling
                .as_ref()
                .map(|p| Duration::from_secs(p.interval.max(1)))
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        }
    }
}
