//! PulsarCluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s.
//!
//! A `PulsarCluster` declares the full desired state of one Pulsar cluster:
//! cluster-wide defaults under `global`, and one spec per component
//! (zookeeper, bookkeeper, broker, proxy). Each component is either a single
//! implicit "default" resource set, or a non-empty mapping of named sets
//! which are scaled and rolled independently.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub type PulsarCluster = PulsarClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// The name of the implicit resource set used when a component declares no sets.
pub const DEFAULT_SET: &str = "default";

/// The sole condition type emitted on a PulsarCluster status.
pub const CONDITION_READY: &str = "Ready";
/// Condition reason: every declared set is reconciled and ready.
pub const REASON_ALL_SETS_READY: &str = "AllSetsReady";
/// Condition reason: one or more sets are still converging.
pub const REASON_SETS_NOT_READY: &str = "SetsNotReady";
/// Condition reason: a transient API error interrupted the pass.
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
/// Condition reason: the declared spec failed validation; not retried.
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

const DEFAULT_IMAGE: &str = "apachepulsar/pulsar:2.10.2";
const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";
const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const DEFAULT_REPLICAS: u32 = 3;
const DEFAULT_ZK_STORAGE: &str = "8Gi";
const DEFAULT_BK_STORAGE: &str = "16Gi";
pub const DEFAULT_AUTOSCALE_PERIOD_SECONDS: u64 = 60;
pub const DEFAULT_AUTOSCALE_STABILIZATION_SECONDS: u64 = 300;
pub const DEFAULT_CPU_HIGH_PERCENT: f64 = 80.0;
pub const DEFAULT_CPU_LOW_PERCENT: f64 = 20.0;
pub const DEFAULT_DISK_HIGH_PERCENT: f64 = 85.0;
pub const DEFAULT_DISK_LOW_PERCENT: f64 = 25.0;
pub const DEFAULT_SCALE_STEP: u32 = 1;
pub const DEFAULT_MIN_REPLICAS: u32 = 1;
pub const DEFAULT_CPU_REQUEST_MILLIS: u64 = 1000;

/// CRD spec for the PulsarCluster resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "PulsarClusterCRD",
    status = "PulsarClusterStatus",
    group = "pulsar.rs",
    version = "v1beta1",
    kind = "PulsarCluster",
    namespaced,
    derive = "PartialEq",
    derive = "Default",
    apiextensions = "v1",
    shortname = "pulsar",
    printcolumn = r#"{"name":"Brokers","type":"number","jsonPath":".spec.broker.replicas"}"#,
    printcolumn = r#"{"name":"Bookies","type":"number","jsonPath":".spec.bookkeeper.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PulsarClusterSpec {
    /// Cluster-wide defaults shared by every component.
    #[serde(default)]
    pub global: GlobalSpec,
    /// The ZooKeeper ensemble backing the cluster's metadata.
    #[serde(default)]
    pub zookeeper: ZooKeeperSpec,
    /// The BookKeeper storage nodes.
    #[serde(default)]
    pub bookkeeper: BookKeeperSpec,
    /// The stateless Pulsar brokers.
    #[serde(default)]
    pub broker: BrokerSpec,
    /// The stateless Pulsar proxies.
    #[serde(default)]
    pub proxy: ProxySpec,
}

impl PulsarClusterSpec {
    /// Resolve every optional field of this spec to a concrete value.
    ///
    /// This routine is total and idempotent: applying it twice yields the
    /// same spec as applying it once, and no optional field is left unset
    /// afterwards.
    pub fn apply_defaults(&mut self) {
        self.global.apply_defaults();
        self.zookeeper.apply_defaults();
        self.bookkeeper.apply_defaults();
        self.broker.apply_defaults();
        self.proxy.apply_defaults();
    }

    /// Validate the declared spec.
    ///
    /// Violations are user errors surfaced as a non-retryable Ready=false
    /// condition; they are never retried automatically.
    pub fn validate(&self) -> Result<(), AppError> {
        for component in Component::ALL.iter() {
            let spec = self.component(*component);
            for (name, set) in spec.declared_sets() {
                if let Some(resource_set) = set.resource_set.as_deref() {
                    if !self.global.resource_sets.contains_key(resource_set) {
                        return Err(AppError::InvalidSpec(format!(
                            "{} set {:?} references unknown resource set {:?}",
                            component, name, resource_set
                        )));
                    }
                }
            }
        }
        if let Some(autoscaler) = self.broker.autoscaler.as_ref() {
            validate_autoscaler(
                "broker",
                autoscaler.high_usage_percent,
                autoscaler.low_usage_percent,
                autoscaler.min_replicas,
                autoscaler.max_replicas,
            )?;
        }
        if let Some(autoscaler) = self.bookkeeper.autoscaler.as_ref() {
            validate_autoscaler(
                "bookkeeper",
                autoscaler.high_usage_percent,
                autoscaler.low_usage_percent,
                autoscaler.min_replicas,
                autoscaler.max_replicas,
            )?;
        }
        Ok(())
    }

    /// Access the given component's set-bearing spec.
    pub fn component(&self, component: Component) -> &dyn SetBearing {
        match component {
            Component::ZooKeeper => &self.zookeeper,
            Component::BookKeeper => &self.bookkeeper,
            Component::Broker => &self.broker,
            Component::Proxy => &self.proxy,
        }
    }
}

fn validate_autoscaler(component: &str, high: Option<f64>, low: Option<f64>, min: Option<u32>, max: Option<u32>) -> Result<(), AppError> {
    if let (Some(high), Some(low)) = (high, low) {
        if low >= high {
            return Err(AppError::InvalidSpec(format!(
                "{} autoscaler low usage threshold {} must be below high threshold {}",
                component, low, high
            )));
        }
    }
    if let Some(min) = min {
        if min == 0 {
            return Err(AppError::InvalidSpec(format!("{} autoscaler min replicas must be at least 1", component)));
        }
        if let Some(max) = max {
            if max < min {
                return Err(AppError::InvalidSpec(format!(
                    "{} autoscaler max replicas {} must be >= min replicas {}",
                    component, max, min
                )));
            }
        }
    }
    Ok(())
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct PulsarClusterStatus {
    /// Observed conditions; exactly one Ready condition per reconciliation pass.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// An observed condition on a PulsarCluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The condition type; always `Ready`.
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// A machine-readable reason for the condition's status.
    pub reason: String,
    /// A human-readable message describing the condition.
    pub message: String,
}

impl Condition {
    /// Build a Ready condition with the given status & reason.
    pub fn ready(status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: CONDITION_READY.into(),
            status: if status { "True".into() } else { "False".into() },
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// The managed components of a Pulsar cluster, in reconciliation order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Component {
    ZooKeeper,
    BookKeeper,
    Broker,
    Proxy,
}

impl Component {
    /// All components in their rollout order: metadata first, storage next,
    /// serving layers last.
    pub const ALL: [Component; 4] = [Component::ZooKeeper, Component::BookKeeper, Component::Broker, Component::Proxy];

    /// The component's canonical name, used in labels & child resource names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::ZooKeeper => "zookeeper",
            Component::BookKeeper => "bookkeeper",
            Component::Broker => "broker",
            Component::Proxy => "proxy",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cluster-wide defaults shared by every component.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSpec {
    /// The container image used by every component unless overridden.
    #[serde(default)]
    pub image: Option<String>,
    /// The image pull policy used by every component.
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    /// The storage class used for stateful component PVCs.
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Whether components communicate over TLS.
    #[serde(default)]
    pub tls_enabled: bool,
    /// Node selector applied to every component pod.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Named resource sets carrying placement metadata which component sets
    /// may bind to.
    #[serde(default)]
    pub resource_sets: BTreeMap<String, ResourceSetMeta>,
    /// The Kubernetes cluster DNS domain, used when deriving FQDNs.
    #[serde(default)]
    pub cluster_domain: Option<String>,
}

impl GlobalSpec {
    fn apply_defaults(&mut self) {
        self.image.get_or_insert_with(|| DEFAULT_IMAGE.into());
        self.image_pull_policy.get_or_insert_with(|| DEFAULT_IMAGE_PULL_POLICY.into());
        self.cluster_domain.get_or_insert_with(|| DEFAULT_CLUSTER_DOMAIN.into());
    }

    /// The resolved container image.
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    /// The resolved image pull policy.
    pub fn image_pull_policy(&self) -> &str {
        self.image_pull_policy.as_deref().unwrap_or(DEFAULT_IMAGE_PULL_POLICY)
    }

    /// The rack configured for the given resource set, if any.
    pub fn rack_of(&self, resource_set: &str) -> Option<&str> {
        self.resource_sets.get(resource_set).and_then(|meta| meta.rack.as_deref())
    }
}

/// Placement metadata for a named resource set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSetMeta {
    /// The rack (e.g. an availability zone) the set's replicas belong to.
    #[serde(default)]
    pub rack: Option<String>,
    /// Additional node selector terms for the set's pods.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

/// One named subset of a component's replicas.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetSpec {
    /// Replica count for this set; falls back to the component replica count.
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Optional reference to a named resource set in `global.resourceSets`.
    #[serde(default)]
    pub resource_set: Option<String>,
    /// Additional node selector terms for this set's pods.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

/// Shared pod tuning for a component.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPolicy {
    /// CPU request per pod, e.g. `1000m`.
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory request per pod, e.g. `2Gi`.
    #[serde(default)]
    pub memory: Option<String>,
    /// Node selector applied to the component's pods.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

/// How a component's sets are rolled out.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum UpdateStrategy {
    /// Sets are updated one at a time; later sets are untouched until the
    /// current one is ready.
    RollingUpdate,
    /// All sets may be updated concurrently, with no readiness gating.
    Parallel,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        UpdateStrategy::RollingUpdate
    }
}

/// A component spec carrying named resource sets.
///
/// Implemented by every component so the generic set reconciler can drive
/// them uniformly.
pub trait SetBearing {
    /// The declared set mapping; may be empty.
    fn declared_sets(&self) -> &IndexMap<String, SetSpec>;

    /// The component-level replica count used by the implicit default set.
    fn default_replicas(&self) -> u32;

    /// The component's update strategy.
    fn strategy(&self) -> UpdateStrategy;

    /// The effective, ordered sets: either the declared mapping with replica
    /// counts resolved, or the implicit single default set.
    fn effective_sets(&self) -> Vec<(String, SetSpec)> {
        if self.declared_sets().is_empty() {
            return vec![(
                DEFAULT_SET.to_string(),
                SetSpec { replicas: Some(self.default_replicas()), ..Default::default() },
            )];
        }
        self.declared_sets()
            .iter()
            .map(|(name, set)| {
                let mut set = set.clone();
                set.replicas.get_or_insert(self.default_replicas());
                (name.clone(), set)
            })
            .collect()
    }
}

macro_rules! impl_set_bearing {
    ($ty:ty) => {
        impl SetBearing for $ty {
            fn declared_sets(&self) -> &IndexMap<String, SetSpec> {
                &self.sets
            }

            fn default_replicas(&self) -> u32 {
                self.replicas.unwrap_or(DEFAULT_REPLICAS)
            }

            fn strategy(&self) -> UpdateStrategy {
                self.update_strategy.unwrap_or_default()
            }
        }
    };
}

/// The ZooKeeper ensemble spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZooKeeperSpec {
    /// Replica count used when no sets are declared.
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Set rollout strategy; defaults to RollingUpdate.
    #[serde(default)]
    pub update_strategy: Option<UpdateStrategy>,
    /// Named resource sets; empty means one implicit default set.
    /// Declaration order is the rollout order.
    #[serde(default)]
    pub sets: IndexMap<String, SetSpec>,
    /// PVC size for each replica's data volume.
    #[serde(default)]
    pub storage_size: Option<String>,
    /// Pod tuning.
    #[serde(default)]
    pub pod: Option<PodPolicy>,
}

impl_set_bearing!(ZooKeeperSpec);

impl ZooKeeperSpec {
    fn apply_defaults(&mut self) {
        self.replicas.get_or_insert(DEFAULT_REPLICAS);
        self.update_strategy.get_or_insert_with(Default::default);
        self.storage_size.get_or_insert_with(|| DEFAULT_ZK_STORAGE.into());
        self.pod.get_or_insert_with(Default::default);
    }
}

/// The BookKeeper storage node spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookKeeperSpec {
    /// Replica count used when no sets are declared.
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Set rollout strategy; defaults to RollingUpdate.
    #[serde(default)]
    pub update_strategy: Option<UpdateStrategy>,
    /// Named resource sets; empty means one implicit default set.
    /// Declaration order is the rollout order.
    #[serde(default)]
    pub sets: IndexMap<String, SetSpec>,
    /// PVC size for each bookie's ledger volume.
    #[serde(default)]
    pub storage_size: Option<String>,
    /// Disk-usage based autoscaling of bookie sets.
    #[serde(default)]
    pub autoscaler: Option<BookKeeperAutoscalerSpec>,
    /// Pod tuning.
    #[serde(default)]
    pub pod: Option<PodPolicy>,
}

impl_set_bearing!(BookKeeperSpec);

impl BookKeeperSpec {
    fn apply_defaults(&mut self) {
        self.replicas.get_or_insert(DEFAULT_REPLICAS);
        self.update_strategy.get_or_insert_with(Default::default);
        self.storage_size.get_or_insert_with(|| DEFAULT_BK_STORAGE.into());
        self.pod.get_or_insert_with(Default::default);
        if let Some(autoscaler) = self.autoscaler.as_mut() {
            autoscaler.apply_defaults();
        }
    }
}

/// The Pulsar broker spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Replica count used when no sets are declared.
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Set rollout strategy; defaults to RollingUpdate.
    #[serde(default)]
    pub update_strategy: Option<UpdateStrategy>,
    /// Named resource sets; empty means one implicit default set.
    /// Declaration order is the rollout order.
    #[serde(default)]
    pub sets: IndexMap<String, SetSpec>,
    /// CPU based autoscaling of broker sets.
    #[serde(default)]
    pub autoscaler: Option<BrokerAutoscalerSpec>,
    /// Pod tuning.
    #[serde(default)]
    pub pod: Option<PodPolicy>,
}

impl_set_bearing!(BrokerSpec);

impl BrokerSpec {
    fn apply_defaults(&mut self) {
        self.replicas.get_or_insert(DEFAULT_REPLICAS);
        self.update_strategy.get_or_insert_with(Default::default);
        self.pod.get_or_insert_with(Default::default);
        if let Some(autoscaler) = self.autoscaler.as_mut() {
            autoscaler.apply_defaults();
        }
    }
}

/// The Pulsar proxy spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// Replica count used when no sets are declared.
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Set rollout strategy; defaults to RollingUpdate.
    #[serde(default)]
    pub update_strategy: Option<UpdateStrategy>,
    /// Named resource sets; empty means one implicit default set.
    /// Declaration order is the rollout order.
    #[serde(default)]
    pub sets: IndexMap<String, SetSpec>,
    /// Pod tuning.
    #[serde(default)]
    pub pod: Option<PodPolicy>,
}

impl_set_bearing!(ProxySpec);

impl ProxySpec {
    fn apply_defaults(&mut self) {
        self.replicas.get_or_insert(DEFAULT_REPLICAS);
        self.update_strategy.get_or_insert_with(Default::default);
        self.pod.get_or_insert_with(Default::default);
    }
}

/// Where broker usage samples are read from.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum BrokerUsageSource {
    /// CPU usage from the Kubernetes metrics API, compared against the
    /// configured CPU request.
    Metrics,
    /// An in-process load report fetched by exec'ing into each pod.
    LoadReport,
}

impl Default for BrokerUsageSource {
    fn default() -> Self {
        BrokerUsageSource::Metrics
    }
}

/// CPU based autoscaling policy for broker sets.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAutoscalerSpec {
    /// Whether autoscaling is active for this component.
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between autoscaler cycles.
    #[serde(default)]
    pub period_seconds: Option<u64>,
    /// Mean usage percent above which the set scales up.
    #[serde(default)]
    pub high_usage_percent: Option<f64>,
    /// Mean usage percent below which the set scales down.
    #[serde(default)]
    pub low_usage_percent: Option<f64>,
    /// Replicas added on a scale-up decision.
    #[serde(default)]
    pub scale_up_by: Option<u32>,
    /// Replicas removed on a scale-down decision.
    #[serde(default)]
    pub scale_down_by: Option<u32>,
    /// Floor for the replica count; never below 1.
    #[serde(default)]
    pub min_replicas: Option<u32>,
    /// Optional ceiling for the replica count.
    #[serde(default)]
    pub max_replicas: Option<u32>,
    /// Seconds a freshly started pod is excluded from usage sampling.
    #[serde(default)]
    pub stabilization_seconds: Option<u64>,
    /// Where usage samples are read from.
    #[serde(default)]
    pub usage_source: BrokerUsageSource,
    /// The per-pod CPU request, in millicores, usage is compared against.
    #[serde(default)]
    pub cpu_request_millis: Option<u64>,
}

impl BrokerAutoscalerSpec {
    fn apply_defaults(&mut self) {
        self.period_seconds.get_or_insert(DEFAULT_AUTOSCALE_PERIOD_SECONDS);
        self.high_usage_percent.get_or_insert(DEFAULT_CPU_HIGH_PERCENT);
        self.low_usage_percent.get_or_insert(DEFAULT_CPU_LOW_PERCENT);
        self.scale_up_by.get_or_insert(DEFAULT_SCALE_STEP);
        self.scale_down_by.get_or_insert(DEFAULT_SCALE_STEP);
        self.min_replicas.get_or_insert(DEFAULT_MIN_REPLICAS);
        self.stabilization_seconds.get_or_insert(DEFAULT_AUTOSCALE_STABILIZATION_SECONDS);
        self.cpu_request_millis.get_or_insert(DEFAULT_CPU_REQUEST_MILLIS);
    }
}

/// Disk-usage based autoscaling policy for bookie sets.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookKeeperAutoscalerSpec {
    /// Whether autoscaling is active for this component.
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between autoscaler cycles.
    #[serde(default)]
    pub period_seconds: Option<u64>,
    /// Mean disk-usage percent above which the set scales up.
    #[serde(default)]
    pub high_usage_percent: Option<f64>,
    /// Mean disk-usage percent below which the set scales down.
    #[serde(default)]
    pub low_usage_percent: Option<f64>,
    /// Replicas added on a scale-up decision.
    #[serde(default)]
    pub scale_up_by: Option<u32>,
    /// Replicas decommissioned on a scale-down decision.
    #[serde(default)]
    pub scale_down_by: Option<u32>,
    /// Floor for the replica count; never below 1.
    #[serde(default)]
    pub min_replicas: Option<u32>,
    /// Optional ceiling for the replica count.
    #[serde(default)]
    pub max_replicas: Option<u32>,
    /// Seconds a freshly started pod is excluded from usage sampling.
    #[serde(default)]
    pub stabilization_seconds: Option<u64>,
}

impl BookKeeperAutoscalerSpec {
    fn apply_defaults(&mut self) {
        self.period_seconds.get_or_insert(DEFAULT_AUTOSCALE_PERIOD_SECONDS);
        self.high_usage_percent.get_or_insert(DEFAULT_DISK_HIGH_PERCENT);
        self.low_usage_percent.get_or_insert(DEFAULT_DISK_LOW_PERCENT);
        self.scale_up_by.get_or_insert(DEFAULT_SCALE_STEP);
        self.scale_down_by.get_or_insert(DEFAULT_SCALE_STEP);
        self.min_replicas.get_or_insert(DEFAULT_MIN_REPLICAS);
        self.stabilization_seconds.get_or_insert(DEFAULT_AUTOSCALE_STABILIZATION_SECONDS);
    }
}
