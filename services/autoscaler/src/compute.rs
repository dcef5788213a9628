//! GCE compute API client.
//!
//! Thin REST client over the zone instances and operations collections:
//! - listing instances (paginated until exhausted)
//! - inserting one instance
//! - waiting for a zone operation to reach a terminal state
//!
//! The [`ComputeApi`] trait is the seam between the autoscaler and the cloud:
//! production code uses [`ComputeClient`], tests substitute mocks.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::Config;

/// Overall deadline for one operation to reach a terminal state.
const OPERATION_WAIT_DEADLINE: Duration = Duration::from_secs(300);

/// Per-request timeout on the server-side operation wait, which blocks
/// until the operation finishes or the server gives up (~2 minutes).
const OPERATION_WAIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(150);

/// Compute API errors, classified for the loop's retry policy.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Transport-level failure (connect, timeout, body decode).
    #[error("compute API transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status from the API.
    #[error("compute API returned {status}: {message}")]
    Api { status: StatusCode, message: String },

    /// A zone operation reached DONE carrying an error payload.
    #[error("operation {name} failed with {code}: {message}")]
    Operation {
        name: String,
        code: String,
        message: String,
    },

    /// A zone operation did not finish before the deadline.
    #[error("operation {name} still {status} after {waited:?}")]
    OperationTimeout {
        name: String,
        status: String,
        waited: Duration,
    },
}

impl ComputeError {
    /// Whether retrying cannot succeed.
    ///
    /// Quota and resource-pool exhaustion clear on their own; malformed
    /// requests and missing images do not.
    pub fn is_permanent(&self) -> bool {
        match self {
            ComputeError::Transport(_) => false,
            ComputeError::Api { status, .. } => {
                status.is_client_error()
                    && *status != StatusCode::REQUEST_TIMEOUT
                    && *status != StatusCode::TOO_MANY_REQUESTS
            }
            ComputeError::Operation { code, .. } => !matches!(
                code.as_str(),
                "QUOTA_EXCEEDED"
                    | "RATE_LIMIT_EXCEEDED"
                    | "RESOURCE_POOL_EXHAUSTED"
                    | "ZONE_RESOURCE_POOL_EXHAUSTED"
            ),
            ComputeError::OperationTimeout { .. } => false,
        }
    }
}

/// Instance as reported by zone inventory.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Tags,
}

impl Instance {
    /// Whether the instance carries the given network tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.items.iter().any(|t| t == tag)
    }
}

/// Network tags attached to an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tags {
    #[serde(default)]
    pub items: Vec<String>,
}

/// One page of a zone instance listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Zone operation handle returned by mutating calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    /// PENDING, RUNNING, or DONE.
    pub status: String,
    #[serde(default)]
    pub error: Option<OperationErrors>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationErrorDetail {
    pub code: String,
    pub message: String,
}

/// Instance creation request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResource {
    pub name: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub scheduling: Scheduling,
    pub service_accounts: Vec<ServiceAccount>,
    pub metadata: Metadata,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    pub auto_delete: bool,
    pub boot: bool,
    #[serde(rename = "type")]
    pub disk_kind: String,
    pub initialize_params: InitializeParams,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// int64 fields travel as strings in the compute JSON API.
    pub disk_size_gb: String,
    pub disk_type: String,
    pub source_image: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub network: String,
    pub subnetwork: String,
    pub stack_type: String,
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    pub name: String,
    pub network_tier: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    pub automatic_restart: bool,
    pub provisioning_model: String,
    pub instance_termination_action: String,
    pub on_host_maintenance: String,
    pub max_run_duration: MaxRunDuration,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaxRunDuration {
    pub seconds: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

/// Cloud inventory and provisioning operations used by the autoscaler.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// List every instance in a zone, following pagination to exhaustion.
    async fn list_instances(&self, zone: &str) -> Result<Vec<Instance>, ComputeError>;

    /// Submit an instance creation and return its zone operation handle.
    async fn insert_instance(
        &self,
        zone: &str,
        instance: &InstanceResource,
    ) -> Result<Operation, ComputeError>;

    /// Block until the operation reaches a terminal state, surfacing any
    /// operation-level failure as an error.
    async fn wait_operation(&self, zone: &str, name: &str) -> Result<(), ComputeError>;
}

/// GCE compute REST client.
pub struct ComputeClient {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    token: Option<String>,
}

impl ComputeClient {
    /// Create a new compute client from configuration.
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.compute_api_url.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            token: config.compute_token.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{}/{}", self.base_url, self.project_id, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ComputeError> {
    if !response.status().is_success() {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        error!(status = %status, body = %message, "Compute API request failed");
        return Err(ComputeError::Api { status, message });
    }
    Ok(response)
}

#[async_trait]
impl ComputeApi for ComputeClient {
    async fn list_instances(&self, zone: &str) -> Result<Vec<Instance>, ComputeError> {
        let url = self.url(&format!("zones/{zone}/instances"));
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.authorize(self.client.get(&url));
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = check(request.send().await?).await?;
            let page: InstanceList = response.json().await?;
            instances.extend(page.items);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(zone, count = instances.len(), "Listed zone instances");
        Ok(instances)
    }

    async fn insert_instance(
        &self,
        zone: &str,
        instance: &InstanceResource,
    ) -> Result<Operation, ComputeError> {
        let url = self.url(&format!("zones/{zone}/instances"));
        debug!(zone, name = %instance.name, "Submitting instance insert");

        let response = check(
            self.authorize(self.client.post(&url))
                .json(instance)
                .send()
                .await?,
        )
        .await?;

        let operation: Operation = response.json().await?;
        debug!(zone, operation = %operation.name, status = %operation.status, "Insert submitted");
        Ok(operation)
    }

    async fn wait_operation(&self, zone: &str, name: &str) -> Result<(), ComputeError> {
        let url = self.url(&format!("zones/{zone}/operations/{name}/wait"));
        let started = Instant::now();

        loop {
            let response = check(
                self.authorize(self.client.post(&url))
                    .timeout(OPERATION_WAIT_REQUEST_TIMEOUT)
                    .send()
                    .await?,
            )
            .await?;

            let operation: Operation = response.json().await?;
            if operation.status == "DONE" {
                if let Some(failure) = operation.error {
                    let detail =
                        failure
                            .errors
                            .into_iter()
                            .next()
                            .unwrap_or(OperationErrorDetail {
                                code: "UNKNOWN".to_string(),
                                message: "operation failed without detail".to_string(),
                            });
                    return Err(ComputeError::Operation {
                        name: name.to_string(),
                        code: detail.code,
                        message: detail.message,
                    });
                }
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= OPERATION_WAIT_DEADLINE {
                return Err(ComputeError::OperationTimeout {
                    name: name.to_string(),
                    status: operation.status,
                    waited,
                });
            }

            debug!(zone, operation = %name, status = %operation.status, "Operation not terminal yet");
        }
    }
}
