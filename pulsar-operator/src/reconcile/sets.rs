//! Kube-backed `SetController` for the managed component kinds.
//!
//! One instance per component; each maps a resource set to a single
//! StatefulSet and the component to one shared Service. All writes go
//! through K8s Server-Side Apply, so a stale object is rejected by the API
//! server rather than silently overwritten.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use serde_json::{json, Map, Value};
use tokio::time::timeout;

use crate::factory;
use crate::k8s::APP_NAME;
use crate::reconcile::SetController;
use pulsar_core::crd::{Component, PulsarCluster, RequiredMetadata, SetSpec, UpdateStrategy};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// A `SetController` bound to the K8s API for one component kind.
pub struct KubeSetController {
    client: Client,
    namespace: String,
    component: Component,
}

impl KubeSetController {
    /// Create a new instance.
    pub fn new(client: Client, namespace: String, component: Component) -> Self {
        Self { client, namespace, component }
    }

    /// The global spec & component spec as raw JSON maps, used for slicing.
    fn spec_parts(&self, cluster: &PulsarCluster) -> Result<(Value, Map<String, Value>)> {
        let global = serde_json::to_value(&cluster.spec.global).context("error serializing global spec")?;
        let component = match self.component {
            Component::ZooKeeper => serde_json::to_value(&cluster.spec.zookeeper),
            Component::BookKeeper => serde_json::to_value(&cluster.spec.bookkeeper),
            Component::Broker => serde_json::to_value(&cluster.spec.broker),
            Component::Proxy => serde_json::to_value(&cluster.spec.proxy),
        }
        .context("error serializing component spec")?;
        let component = match component {
            Value::Object(map) => map,
            _ => Default::default(), // Component specs always serialize as objects.
        };
        Ok((global, component))
    }

    /// The effective spec of the named set.
    fn effective_set(&self, cluster: &PulsarCluster, set: &str) -> Result<SetSpec> {
        cluster
            .spec
            .component(self.component)
            .effective_sets()
            .into_iter()
            .find(|(name, _)| name == set)
            .map(|(_, spec)| spec)
            .with_context(|| format!("unknown {} set {:?}", self.component, set))
    }

    /// Fetch the StatefulSet backing the given set, if it exists.
    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let res = timeout(API_TIMEOUT, api.get(name))
            .await
            .context("timeout while fetching StatefulSet")?;
        match res {
            Ok(sts) => Ok(Some(sts)),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(err).context("error fetching StatefulSet"),
        }
    }

    /// Patch the given StatefulSet in K8s using Server-Side Apply.
    async fn patch_statefulset(&self, mut sts: StatefulSet) -> Result<()> {
        if let Some(name) = sts.metadata.name.as_ref() {
            tracing::info!(%name, "patching StatefulSet");
        }
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        sts.metadata.managed_fields = None;
        let name = sts.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&sts)))
            .await
            .context("timeout while patching StatefulSet")?
            .context("error patching StatefulSet")?;
        Ok(())
    }

    /// Delete the target StatefulSet, tolerating objects already gone.
    async fn delete_statefulset(&self, name: &str) -> Result<()> {
        tracing::info!(name, "deleting StatefulSet");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting StatefulSet")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting StatefulSet"),
            },
        }
    }
}

#[async_trait]
impl SetController for KubeSetController {
    fn component(&self) -> &'static str {
        self.component.as_str()
    }

    fn strategy(&self, cluster: &PulsarCluster) -> UpdateStrategy {
        cluster.spec.component(self.component).strategy()
    }

    fn set_names(&self, cluster: &PulsarCluster) -> Vec<String> {
        cluster
            .spec
            .component(self.component)
            .effective_sets()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    fn common_slice(&self, cluster: &PulsarCluster) -> Result<Value> {
        let (global, mut component) = self.spec_parts(cluster)?;
        // Set-scoped fields are compared through set slices only; the
        // autoscaler policy drives background daemons, not manifests.
        component.remove("sets");
        component.remove("replicas");
        component.remove("autoscaler");
        Ok(json!({"global": global, "component": component}))
    }

    fn set_slice(&self, cluster: &PulsarCluster, set: &str) -> Result<Value> {
        let (global, mut component) = self.spec_parts(cluster)?;
        component.remove("replicas");
        component.remove("autoscaler");
        let effective = self.effective_set(cluster, set)?;
        let set_value = serde_json::to_value(&effective).context("error serializing set spec")?;
        // All sibling sets cleared so one set's change cannot mask another's.
        component.insert("sets".into(), json!({ set: set_value }));
        Ok(json!({"global": global, "component": component}))
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn apply_common(&self, cluster: &PulsarCluster) -> Result<()> {
        let mut service = factory::build_component_service(cluster, self.component);
        let name = service.metadata.name.clone().unwrap_or_default();
        tracing::info!(service = %name, "patching shared Service");
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        service.metadata.managed_fields = None;
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&service)))
            .await
            .context("timeout while patching shared Service")?
            .context("error patching shared Service")?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn apply_set(&self, cluster: &PulsarCluster, set: &str) -> Result<()> {
        let set_spec = self.effective_set(cluster, set)?;
        let sts = factory::build_statefulset(cluster, self.component, set, &set_spec);
        self.patch_statefulset(sts).await
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn delete_set(&self, cluster: &PulsarCluster, set: &str) -> Result<()> {
        self.delete_statefulset(&factory::sts_name(cluster.name(), self.component, set)).await
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn set_ready(&self, cluster: &PulsarCluster, set: &str) -> Result<bool> {
        let name = factory::sts_name(cluster.name(), self.component, set);
        let sts = match self.get_statefulset(&name).await? {
            Some(sts) => sts,
            None => return Ok(false),
        };
        let desired = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0);
        let generation = sts.metadata.generation;
        let status = match sts.status.as_ref() {
            Some(status) => status,
            None => return Ok(false),
        };
        let observed = status.observed_generation == generation;
        let ready = status.ready_replicas.unwrap_or(0) == desired && status.updated_replicas.unwrap_or(0) == desired;
        Ok(observed && ready)
    }
}
