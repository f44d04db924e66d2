//! Versioned coordination-state storage.
//!
//! The rack monitor persists its mapping through this capability. The only
//! consistency mechanism is optimistic concurrency: reads return a version
//! stamp, writes carry the expected one, and a mismatch fails loudly instead
//! of overwriting a concurrent writer.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::client::Client;
use maplit::btreemap;
use tokio::time::timeout;

use crate::factory;
use pulsar_core::AppError;

const API_TIMEOUT: Duration = Duration::from_secs(10);

/// The key holding a node's payload inside its backing ConfigMap.
const DATA_KEY: &str = "data";

/// A versioned node store. Paths are opaque, `/`-separated identifiers.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read the node at `path`. Returns the payload and its version stamp,
    /// both `None` when the node does not exist yet.
    async fn read(&self, path: &str) -> Result<(Option<String>, Option<String>)>;

    /// Write `data` at `path`, but only if the node's version still matches
    /// `expected_version` (`None` asserts the node does not exist). A
    /// concurrent write surfaces as [`AppError::VersionConflict`].
    async fn write(&self, path: &str, data: String, expected_version: Option<String>) -> Result<()>;
}

/// `CoordinationStore` backed by one ConfigMap per node, keyed by the
/// ConfigMap's `resourceVersion`. The API server enforces the version check
/// on replace, so a stale write comes back as a 409.
pub struct KubeCoordinationStore {
    api: Api<ConfigMap>,
    cluster: String,
}

impl KubeCoordinationStore {
    /// Create a new instance scoped to the given cluster.
    pub fn new(client: Client, namespace: &str, cluster: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), cluster: cluster.to_string() }
    }

    fn configmap_name(&self, path: &str) -> String {
        format!("{}-coord-{}", self.cluster, path.trim_matches('/').replace('/', "-"))
    }

    fn build(&self, path: &str, data: String, resource_version: Option<String>) -> ConfigMap {
        let mut labels = btreemap! {
            factory::LABEL_PULSAR_RS_CLUSTER.to_string() => self.cluster.clone(),
        };
        factory::set_canonical_labels(&mut labels);
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.configmap_name(path)),
                labels: Some(labels),
                resource_version,
                ..Default::default()
            },
            data: Some(btreemap! { DATA_KEY.to_string() => data }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl CoordinationStore for KubeCoordinationStore {
    async fn read(&self, path: &str) -> Result<(Option<String>, Option<String>)> {
        let name = self.configmap_name(path);
        match timeout(API_TIMEOUT, self.api.get(&name)).await.context("timeout while reading coordination node")? {
            Ok(cm) => {
                let data = cm.data.as_ref().and_then(|data| data.get(DATA_KEY)).cloned();
                Ok((data, cm.metadata.resource_version))
            }
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok((None, None)),
            Err(err) => Err(err).context("error reading coordination node"),
        }
    }

    async fn write(&self, path: &str, data: String, expected_version: Option<String>) -> Result<()> {
        let name = self.configmap_name(path);
        let cm = self.build(path, data, expected_version.clone());
        let res = match expected_version {
            None => timeout(API_TIMEOUT, self.api.create(&PostParams::default(), &cm))
                .await
                .context("timeout while creating coordination node")?,
            Some(_) => timeout(API_TIMEOUT, self.api.replace(&name, &PostParams::default(), &cm))
                .await
                .context("timeout while replacing coordination node")?,
        };
        match res {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::CONFLICT => {
                Err(AppError::VersionConflict(path.to_string()).into())
            }
            Err(err) => Err(err).context("error writing coordination node"),
        }
    }
}
