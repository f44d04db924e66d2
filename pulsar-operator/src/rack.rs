//! Bookie rack topology monitor.
//!
//! BookKeeper spreads ledger replicas across racks when a rack mapping is
//! available. The monitor derives the expected mapping for every bookie
//! replica from the declared spec and the nodes their pods landed on, and
//! keeps the persisted mapping in sync through the coordination store.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::bookies::Bookie;
use crate::coordination::CoordinationStore;
use crate::daemon::DaemonTask;
use crate::diff;
use crate::factory;
use pulsar_core::crd::{Component, PulsarClusterSpec, SetBearing};

const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the rack mapping lives in the coordination store.
pub const RACK_CONFIG_PATH: &str = "/bookies";

/// Rack segment used for replicas that have not been scheduled onto a node.
pub const UNKNOWN_NODE: &str = "unknown-node";

/// Rack segment used for sets with no rack bound to their resource set.
const DEFAULT_RACK: &str = "default";

/// Placement facts for one bookie as BookKeeper wants them.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BookieRackInfo {
    pub hostname: String,
    pub rack: String,
}

/// The persisted mapping, `group -> bookie-id -> placement`. Ordered so the
/// serialized form is deterministic.
pub type BookiesRackConfiguration = BTreeMap<String, BTreeMap<String, BookieRackInfo>>;

/// Compute the expected rack mapping for every bookie replica of the
/// cluster. `nodes` maps pod name to the node it is scheduled on; absent or
/// unscheduled pods fall back to the [`UNKNOWN_NODE`] sentinel. Deterministic
/// for fixed inputs.
pub fn compute_expected(
    cluster: &str,
    namespace: &str,
    spec: &PulsarClusterSpec,
    nodes: &BTreeMap<String, String>,
) -> BookiesRackConfiguration {
    let mut config = BookiesRackConfiguration::new();
    for (set_name, set) in spec.bookkeeper.effective_sets() {
        let resource_set = set.resource_set.as_deref();
        let configured_rack = resource_set
            .and_then(|name| spec.global.rack_of(name))
            .unwrap_or(DEFAULT_RACK);
        let group = config.entry(resource_set.unwrap_or(&set_name).to_string()).or_default();
        for ordinal in 0..set.replicas.unwrap_or(0) {
            let bookie = Bookie::new(cluster, namespace, &set_name, ordinal);
            let node = nodes.get(&bookie.pod).map(String::as_str).unwrap_or(UNKNOWN_NODE);
            group.insert(
                bookie.id.clone(),
                BookieRackInfo {
                    hostname: bookie.id,
                    rack: format!("{}/{}", configured_rack, node),
                },
            );
        }
    }
    config
}

/// Diff the expected mapping against the persisted one and, when they
/// disagree, write the expected mapping back under the version stamp read in
/// this same cycle. Returns whether a write happened.
pub async fn sync_rack_config<S: CoordinationStore>(
    store: &S,
    expected: &BookiesRackConfiguration,
) -> Result<bool> {
    let (current, version) = store.read(RACK_CONFIG_PATH).await?;
    let current: serde_json::Value = match current {
        Some(raw) => serde_json::from_str(&raw).context("error parsing persisted rack configuration")?,
        None => serde_json::json!({}),
    };
    let expected_value = serde_json::to_value(expected).context("error serializing rack configuration")?;
    let changed = diff::diff(&expected_value, &current)?;
    if changed.is_equal() {
        return Ok(false);
    }
    tracing::info!(fields = %changed, "rack configuration drifted, updating");
    let raw = serde_json::to_string(expected).context("error serializing rack configuration")?;
    store.write(RACK_CONFIG_PATH, raw, version).await?;
    Ok(true)
}

/// Periodic task keeping the persisted rack mapping in sync for one cluster.
pub struct RackMonitor<S> {
    name: String,
    cluster: String,
    namespace: String,
    spec: PulsarClusterSpec,
    pods: Api<Pod>,
    store: S,
}

impl<S: CoordinationStore> RackMonitor<S> {
    /// Create a new instance. The spec snapshot stays valid because the
    /// daemon scheduler rebuilds this task whenever the spec changes.
    pub fn new(client: Client, namespace: &str, cluster: &str, spec: PulsarClusterSpec, store: S) -> Self {
        Self {
            name: "rack-monitor".to_string(),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            spec,
            pods: Api::namespaced(client, namespace),
            store,
        }
    }

    /// Node names per bookie pod, taken from the live pod list.
    async fn bookie_nodes(&self) -> Result<BTreeMap<String, String>> {
        let selector = format!(
            "{},{}={},{}={}",
            pulsar_core::PULSAR_OPERATOR_LABEL_SELECTORS,
            factory::LABEL_PULSAR_RS_CLUSTER,
            self.cluster,
            factory::LABEL_PULSAR_RS_COMPONENT,
            Component::BookKeeper.as_str(),
        );
        let pods = timeout(API_TIMEOUT, self.pods.list(&ListParams::default().labels(&selector)))
            .await
            .context("timeout while listing bookie pods")?
            .context("error listing bookie pods")?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name?;
                let node = pod.spec.and_then(|spec| spec.node_name)?;
                Some((name, node))
            })
            .collect())
    }

    async fn cycle(&self) -> Result<()> {
        let nodes = self.bookie_nodes().await?;
        let expected = compute_expected(&self.cluster, &self.namespace, &self.spec, &nodes);
        sync_rack_config(&self.store, &expected).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: CoordinationStore + 'static> DaemonTask for RackMonitor<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) {
        if let Err(err) = self.cycle().await {
            tracing::error!(error = ?err, cluster = %self.cluster, "error during rack monitor cycle");
        }
    }
}
