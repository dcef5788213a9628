//! spotscale autoscaler library.
//!
//! A scale-up reconciliation loop for ephemeral Buildkite workers on GCE:
//! sample queue demand, count tagged workers across the region's zones, and
//! provision at most one spot worker per cycle while under the configured
//! ceiling.
//!
//! ## Modules
//!
//! - `buildkite`: agent metrics client (demand sampling)
//! - `compute`: GCE REST client and wire types (inventory + provisioning)
//! - `supply`: tag-based supply accounting across zones
//! - `provisioner`: unique naming and the spot instance request shape
//! - `scaler`: the control loop
//! - `config`: startup configuration

pub mod buildkite;
pub mod compute;
pub mod config;
pub mod provisioner;
pub mod scaler;
pub mod supply;

// Re-export commonly used types
pub use compute::{ComputeApi, ComputeClient, ComputeError};
pub use config::Config;
pub use scaler::Autoscaler;
pub use supply::WORKER_TAG;
