//! Pulsar CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod cluster;
#[cfg(test)]
mod cluster_test;

use kube::Resource;

pub use cluster::{
    BookKeeperAutoscalerSpec, BookKeeperSpec, BrokerAutoscalerSpec, BrokerSpec, BrokerUsageSource, Component, Condition, GlobalSpec, PodPolicy,
    ProxySpec, PulsarCluster, PulsarClusterSpec, PulsarClusterStatus, ResourceSetMeta, SetBearing, SetSpec, UpdateStrategy, ZooKeeperSpec,
    CONDITION_READY, DEFAULT_AUTOSCALE_PERIOD_SECONDS, DEFAULT_AUTOSCALE_STABILIZATION_SECONDS, DEFAULT_CPU_HIGH_PERCENT,
    DEFAULT_CPU_LOW_PERCENT, DEFAULT_CPU_REQUEST_MILLIS, DEFAULT_DISK_HIGH_PERCENT, DEFAULT_DISK_LOW_PERCENT, DEFAULT_MIN_REPLICAS,
    DEFAULT_SCALE_STEP, DEFAULT_SET, REASON_ALL_SETS_READY, REASON_INVALID_SPEC, REASON_RECONCILE_ERROR, REASON_SETS_NOT_READY,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for PulsarCluster {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
