//! Kube-backed `ScaleTarget`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use serde_json::json;
use tokio::time::timeout;

use super::{Replica, ScaleTarget};
use crate::factory;
use pulsar_core::crd::{Component, PulsarCluster};

const API_TIMEOUT: Duration = Duration::from_secs(10);

/// A `ScaleTarget` bound to one set's StatefulSet and its governing
/// `PulsarCluster` resource.
pub struct KubeScaleTarget {
    statefulsets: Api<StatefulSet>,
    pods: Api<Pod>,
    clusters: Api<PulsarCluster>,
    cluster: String,
    component: Component,
    set: String,
    /// Whether the component declares named sets; decides where the replica
    /// patch lands on the governing resource.
    explicit_sets: bool,
}

impl KubeScaleTarget {
    /// Create a new instance.
    pub fn new(
        client: Client,
        namespace: &str,
        cluster: &str,
        component: Component,
        set: &str,
        explicit_sets: bool,
    ) -> Self {
        Self {
            statefulsets: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client.clone(), namespace),
            clusters: Api::namespaced(client, namespace),
            cluster: cluster.to_string(),
            component,
            set: set.to_string(),
            explicit_sets,
        }
    }
}

#[async_trait]
impl ScaleTarget for KubeScaleTarget {
    async fn observe(&self) -> Result<Option<Vec<Replica>>> {
        let name = factory::sts_name(&self.cluster, self.component, &self.set);
        let statefulset = match timeout(API_TIMEOUT, self.statefulsets.get(&name)).await.context("timeout while fetching StatefulSet")? {
            Ok(statefulset) => statefulset,
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => return Ok(None),
            Err(err) => return Err(err).context("error fetching StatefulSet"),
        };

        let desired = statefulset.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0);
        let status = statefulset.status.unwrap_or_default();
        let ready = status.observed_generation == statefulset.metadata.generation
            && status.ready_replicas.unwrap_or(0) == desired
            && status.updated_replicas.unwrap_or(0) == desired;
        if !ready {
            return Ok(None);
        }

        let selector = factory::set_selector(&self.cluster, self.component, &self.set);
        let pods = timeout(API_TIMEOUT, self.pods.list(&ListParams::default().labels(&selector)))
            .await
            .context("timeout while listing set pods")?
            .context("error listing set pods")?;
        let mut replicas: Vec<Replica> = pods
            .items
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name?;
                let started_at = pod.status.and_then(|status| status.start_time).map(|time| time.0);
                Some(Replica { pod: name, started_at })
            })
            .collect();
        if replicas.len() as i32 != desired {
            // A pod list out of step with the StatefulSet is a moving target.
            return Ok(None);
        }
        replicas.sort_by(|a, b| a.pod.cmp(&b.pod));
        Ok(Some(replicas))
    }

    async fn patch_replicas(&self, replicas: u32) -> Result<()> {
        let set_patch = json!({ "replicas": replicas });
        let component_patch = if self.explicit_sets {
            json!({ "sets": { (&self.set): set_patch } })
        } else {
            set_patch
        };
        let body = json!({ "spec": { (self.component.as_str()): component_patch } });
        timeout(
            API_TIMEOUT,
            self.clusters.patch(&self.cluster, &PatchParams::default(), &Patch::Merge(&body)),
        )
        .await
        .context("timeout while patching replica count")?
        .context("error patching replica count")?;
        Ok(())
    }
}
