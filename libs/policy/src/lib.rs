//! Scaling decision primitives.
//!
//! This library holds the pure half of the autoscaler: given a snapshot of
//! queue metrics and a way to probe live worker supply, decide whether one
//! more worker should be provisioned. Key concepts:
//!
//! - **Demand**: jobs the queue wants executed (running + scheduled + waiting).
//! - **Supply**: tagged worker instances currently live in the cloud.
//! - **Ceiling**: hard cap on concurrently provisioned workers.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs.
//! - The supply probe is only consulted when the queue reports a deficit;
//!   the satisfied path never costs an inventory round-trip.
//! - At most one provision is recommended per decision.

use std::time::Duration;

use async_trait::async_trait;

/// Snapshot of queue-side metrics for the monitored queue.
///
/// Produced once per reconciliation cycle and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Jobs scheduled but not yet assigned to an agent.
    pub scheduled_jobs: u32,

    /// Jobs currently running on an agent.
    pub running_jobs: u32,

    /// Jobs waiting on dependencies or concurrency groups.
    pub waiting_jobs: u32,

    /// Connected agents with no job.
    pub idle_agents: u32,

    /// Connected agents executing a job.
    pub busy_agents: u32,

    /// Total connected agents for the queue.
    pub total_agents: u32,

    /// Polling cadence requested by the queue service.
    pub poll_interval: Duration,
}

/// Workers the queue needs to drain its backlog.
pub fn desired_workers(metrics: &QueueMetrics) -> u32 {
    metrics.running_jobs + metrics.scheduled_jobs + metrics.waiting_jobs
}

/// Source of the live tagged-instance count.
///
/// Kept behind a trait so the decision stays lazy: implementations typically
/// hit a cloud inventory API, and [`decide`] must be able to skip that call
/// entirely on the satisfied path.
#[async_trait]
pub trait SupplyProbe {
    type Error;

    /// Count currently live instances carrying the worker tag.
    async fn tagged_instances(&self) -> Result<u32, Self::Error>;
}

/// Outcome of one reconciliation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do this cycle.
    Skip(SkipReason),

    /// Provision exactly one new worker.
    Provision { desired: u32, supply: u32 },
}

impl Decision {
    /// Returns true if the decision is to provision a worker.
    pub fn is_provision(&self) -> bool {
        matches!(self, Self::Provision { .. })
    }
}

/// Why a cycle decided not to provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The queue's own agent count already covers demand.
    QueueSatisfied { desired: u32, total_agents: u32 },

    /// Enough tagged instances are live to cover demand.
    NoDeficit { desired: u32, supply: u32 },

    /// The instance ceiling has been reached.
    CeilingReached { supply: u32, ceiling: u32 },
}

/// Decide whether to provision one more worker.
///
/// Policy, evaluated in this exact order:
///
/// 1. `desired = running + scheduled + waiting`.
/// 2. If `desired <= total_agents`, skip without probing supply.
/// 3. Probe the live tagged-instance count.
/// 4. Provision iff `desired > supply && supply < ceiling`.
///
/// Step 2 trades a slightly stale supply view for skipping an inventory call
/// on the common nothing-to-do path. Step 4 enforces the ceiling as a hard
/// cap regardless of demand.
pub async fn decide<P>(
    metrics: &QueueMetrics,
    ceiling: u32,
    supply: &P,
) -> Result<Decision, P::Error>
where
    P: SupplyProbe + ?Sized + Sync,
{
    let desired = desired_workers(metrics);

    if desired <= metrics.total_agents {
        return Ok(Decision::Skip(SkipReason::QueueSatisfied {
            desired,
            total_agents: metrics.total_agents,
        }));
    }

    let supply = supply.tagged_instances().await?;

    if supply >= ceiling {
        return Ok(Decision::Skip(SkipReason::CeilingReached { supply, ceiling }));
    }

    if desired > supply {
        Ok(Decision::Provision { desired, supply })
    } else {
        Ok(Decision::Skip(SkipReason::NoDeficit { desired, supply }))
    }
}
