//! Tag-based supply accounting across zones.

use std::sync::Arc;

use async_trait::async_trait;
use spotscale_policy::SupplyProbe;
use tracing::debug;

use crate::compute::{ComputeApi, ComputeError};

/// Fixed tag identifying worker instances this autoscaler manages.
pub const WORKER_TAG: &str = "buildkite-agent";

/// Counts live tagged workers across the configured zones.
pub struct SupplyAccountant<C> {
    compute: Arc<C>,
    zones: Vec<String>,
    tag: String,
}

impl<C: ComputeApi> SupplyAccountant<C> {
    /// Create an accountant scanning the given zones for the given tag.
    pub fn new(compute: Arc<C>, zones: Vec<String>, tag: impl Into<String>) -> Self {
        Self {
            compute,
            zones,
            tag: tag.into(),
        }
    }

    /// Count instances carrying the tag, summed across zones in order.
    ///
    /// Each instance belongs to exactly one zone, so the sum never double
    /// counts. Fail-fast: any zone's listing error aborts the whole count;
    /// partial sums are never blended with success.
    pub async fn count_tagged(&self) -> Result<u32, ComputeError> {
        let mut count = 0;

        for zone in &self.zones {
            for instance in self.compute.list_instances(zone).await? {
                debug!(
                    zone = %zone,
                    name = %instance.name,
                    status = %instance.status,
                    tags = ?instance.tags.items,
                    "Observed instance"
                );
                if instance.has_tag(&self.tag) {
                    count += 1;
                }
            }
        }

        Ok(count)
    }
}

#[async_trait]
impl<C: ComputeApi> SupplyProbe for SupplyAccountant<C> {
    type Error = ComputeError;

    async fn tagged_instances(&self) -> Result<u32, ComputeError> {
        self.count_tagged().await
    }
}
