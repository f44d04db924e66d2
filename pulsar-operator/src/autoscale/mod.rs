//! CPU and disk driven set autoscalers.
//!
//! One autoscaler instance runs per autoscaled set, scheduled as a periodic
//! daemon task. Each cycle reads fresh replica state, samples usage, and
//! proposes a new replica count under hysteresis, stabilization, and bounds
//! rules; the proposal lands as a single patch of the governing resource's
//! replica field, which the reconciliation stream then converges on.

mod target;
mod usage;
#[cfg(test)]
mod mod_test;

pub use target::KubeScaleTarget;
pub use usage::{LoadReportUsage, MetricsApiUsage, UsageSource};

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bookies::{Bookie, BookieAdmin, DecommissionEngine};
use crate::daemon::DaemonTask;
use pulsar_core::crd::{
    BookKeeperAutoscalerSpec, BrokerAutoscalerSpec, DEFAULT_AUTOSCALE_STABILIZATION_SECONDS, DEFAULT_CPU_HIGH_PERCENT,
    DEFAULT_CPU_LOW_PERCENT, DEFAULT_DISK_HIGH_PERCENT, DEFAULT_DISK_LOW_PERCENT, DEFAULT_MIN_REPLICAS, DEFAULT_SCALE_STEP,
};

/// One live replica of an autoscaled set.
#[derive(Clone, Debug)]
pub struct Replica {
    /// The backing pod's name.
    pub pod: String,
    /// When the pod started; `None` while it has not been scheduled.
    pub started_at: Option<DateTime<Utc>>,
}

/// Read and patch capability over an autoscaled set.
#[async_trait]
pub trait ScaleTarget: Send + Sync {
    /// The set's replicas, in ordinal order, or `None` when the workload is
    /// not fully ready. No scaling decision is made against a moving target.
    async fn observe(&self) -> Result<Option<Vec<Replica>>>;

    /// Patch the set's declared replica count on the governing resource.
    async fn patch_replicas(&self, replicas: u32) -> Result<()>;
}

/// Hysteresis thresholds and bounds of one autoscaled set.
#[derive(Clone, Debug)]
pub struct ScalePolicy {
    pub high_usage_percent: f64,
    pub low_usage_percent: f64,
    pub scale_up_by: u32,
    pub scale_down_by: u32,
    pub min_replicas: u32,
    pub max_replicas: Option<u32>,
    /// Freshly started replicas within this window suppress the whole cycle.
    pub stabilization: Duration,
}

impl ScalePolicy {
    pub fn for_broker(spec: &BrokerAutoscalerSpec) -> Self {
        Self {
            high_usage_percent: spec.high_usage_percent.unwrap_or(DEFAULT_CPU_HIGH_PERCENT),
            low_usage_percent: spec.low_usage_percent.unwrap_or(DEFAULT_CPU_LOW_PERCENT),
            scale_up_by: spec.scale_up_by.unwrap_or(DEFAULT_SCALE_STEP),
            scale_down_by: spec.scale_down_by.unwrap_or(DEFAULT_SCALE_STEP),
            min_replicas: spec.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS),
            max_replicas: spec.max_replicas,
            stabilization: Duration::from_secs(
                spec.stabilization_seconds.unwrap_or(DEFAULT_AUTOSCALE_STABILIZATION_SECONDS),
            ),
        }
    }

    pub fn for_bookkeeper(spec: &BookKeeperAutoscalerSpec) -> Self {
        Self {
            high_usage_percent: spec.high_usage_percent.unwrap_or(DEFAULT_DISK_HIGH_PERCENT),
            low_usage_percent: spec.low_usage_percent.unwrap_or(DEFAULT_DISK_LOW_PERCENT),
            scale_up_by: spec.scale_up_by.unwrap_or(DEFAULT_SCALE_STEP),
            scale_down_by: spec.scale_down_by.unwrap_or(DEFAULT_SCALE_STEP),
            min_replicas: spec.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS),
            max_replicas: spec.max_replicas,
            stabilization: Duration::from_secs(
                spec.stabilization_seconds.unwrap_or(DEFAULT_AUTOSCALE_STABILIZATION_SECONDS),
            ),
        }
    }
}

/// The replica count the policy proposes for the given mean usage.
///
/// Scale-up is capped at `max_replicas`; scale-down is floored at
/// `min_replicas` and never reaches zero. A branch never moves the count in
/// the opposite direction, so a count already outside the bounds stays put
/// until usage crosses the matching threshold.
pub fn next_replicas(policy: &ScalePolicy, current: u32, mean_usage_percent: f64) -> u32 {
    if mean_usage_percent > policy.high_usage_percent {
        let up = current.saturating_add(policy.scale_up_by);
        return policy.max_replicas.map_or(up, |max| up.min(max)).max(current);
    }
    if mean_usage_percent < policy.low_usage_percent {
        return current
            .saturating_sub(policy.scale_down_by)
            .max(policy.min_replicas)
            .max(1)
            .min(current);
    }
    current
}

/// Whether any replica started within the stabilization window, or has not
/// started at all. Usage samples from such replicas are meaningless, so the
/// cycle is suppressed wholesale to avoid oscillation after a scale event.
fn within_stabilization(replicas: &[Replica], window: Duration, now: DateTime<Utc>) -> bool {
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::max_value());
    replicas.iter().any(|replica| match replica.started_at {
        Some(started_at) => now.signed_duration_since(started_at) < window,
        None => true,
    })
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// CPU based autoscaler for one broker set.
pub struct BrokerAutoscaler<T, U> {
    name: String,
    policy: ScalePolicy,
    target: T,
    usage: U,
}

impl<T: ScaleTarget, U: UsageSource> BrokerAutoscaler<T, U> {
    /// Create a new instance for the given set.
    pub fn new(set: &str, policy: ScalePolicy, target: T, usage: U) -> Self {
        Self { name: format!("broker-autoscaler/{}", set), policy, target, usage }
    }

    async fn cycle(&self) -> Result<()> {
        let replicas = match self.target.observe().await? {
            Some(replicas) if !replicas.is_empty() => replicas,
            _ => {
                tracing::debug!(task = %self.name, "set not fully ready, skipping autoscale cycle");
                return Ok(());
            }
        };
        if within_stabilization(&replicas, self.policy.stabilization, Utc::now()) {
            tracing::debug!(task = %self.name, "replicas within stabilization window, skipping autoscale cycle");
            return Ok(());
        }

        let samples = self.usage.sample(&replicas).await?;
        if samples.is_empty() {
            return Ok(());
        }
        let usage = mean(&samples);
        let current = replicas.len() as u32;
        let desired = next_replicas(&self.policy, current, usage);
        if desired != current {
            tracing::info!(task = %self.name, usage, current, desired, "scaling broker set");
            self.target.patch_replicas(desired).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: ScaleTarget + 'static, U: UsageSource + 'static> DaemonTask for BrokerAutoscaler<T, U> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) {
        if let Err(err) = self.cycle().await {
            tracing::error!(error = ?err, task = %self.name, "error during autoscale cycle");
        }
    }
}

/// Disk based autoscaler for one bookie set.
///
/// Scale-up is a plain replica patch; scale-down retires the highest-ordinal
/// bookies through the decommission engine first and only commits the count
/// of bookies that actually completed retirement.
pub struct BookKeeperAutoscaler<T, A> {
    name: String,
    cluster: String,
    namespace: String,
    set: String,
    policy: ScalePolicy,
    target: T,
    engine: DecommissionEngine<A>,
}

impl<T: ScaleTarget, A: BookieAdmin> BookKeeperAutoscaler<T, A> {
    /// Create a new instance for the given cluster's set.
    pub fn new(
        cluster: &str,
        namespace: &str,
        set: &str,
        policy: ScalePolicy,
        target: T,
        engine: DecommissionEngine<A>,
    ) -> Self {
        Self {
            name: format!("bookkeeper-autoscaler/{}", set),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            set: set.to_string(),
            policy,
            target,
            engine,
        }
    }

    fn bookie(&self, ordinal: u32) -> Bookie {
        Bookie::new(&self.cluster, &self.namespace, &self.set, ordinal)
    }

    async fn cycle(&self) -> Result<()> {
        let replicas = match self.target.observe().await? {
            Some(replicas) if !replicas.is_empty() => replicas,
            _ => {
                tracing::debug!(task = %self.name, "set not fully ready, skipping autoscale cycle");
                return Ok(());
            }
        };
        if within_stabilization(&replicas, self.policy.stabilization, Utc::now()) {
            tracing::debug!(task = %self.name, "replicas within stabilization window, skipping autoscale cycle");
            return Ok(());
        }

        let mut samples = Vec::with_capacity(replicas.len());
        for ordinal in 0..replicas.len() as u32 {
            let stats = self.engine.admin().stats(&self.bookie(ordinal)).await?;
            if !stats.writable {
                // A read-only bookie means a decommission is in flight or an
                // operator stepped in; either way, hands off.
                tracing::debug!(task = %self.name, ordinal, "read-only bookie present, skipping autoscale cycle");
                return Ok(());
            }
            samples.push(stats.disk_usage_percent());
        }

        let usage = mean(&samples);
        let current = replicas.len() as u32;
        let desired = next_replicas(&self.policy, current, usage);
        if desired > current {
            tracing::info!(task = %self.name, usage, current, desired, "scaling up bookie set");
            self.target.patch_replicas(desired).await?;
        } else if desired < current {
            // StatefulSet scale-down removes the highest ordinals, so those
            // are the retirement candidates.
            let candidates: Vec<Bookie> = (desired..current).rev().map(|ordinal| self.bookie(ordinal)).collect();
            tracing::info!(task = %self.name, usage, current, desired, "scaling down bookie set");
            let retired = self.engine.retire(&candidates).await as u32;
            if retired > 0 {
                // Commit only what was actually retired, not what was asked.
                self.target.patch_replicas(current - retired).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: ScaleTarget + 'static, A: BookieAdmin + 'static> DaemonTask for BookKeeperAutoscaler<T, A> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) {
        if let Err(err) = self.cycle().await {
            tracing::error!(error = ?err, task = %self.name, "error during autoscale cycle");
        }
    }
}
