//! Reconciliation task processing.
//!
//! Tasks arrive on the controller's queue strictly ordered per cluster. A
//! pass walks every component in rollout order, reconciles its resource
//! sets against the persisted last-applied state, then folds the per
//! component outcomes into a single Ready condition on the cluster status.
//!
//! Transient API errors surface as a Ready=False/ReconcileError condition
//! and a delayed retry of the same task. Validation errors are terminal:
//! they produce Ready=False/InvalidSpec and are not retried, as only a
//! spec change can fix them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use tokio::time::timeout;

use crate::factory::LABEL_PULSAR_RS_CLUSTER;
use crate::k8s::Controller;
use crate::reconcile::{reconcile_component, KubeSetController, LastApplied, Outcome};
use pulsar_core::crd::{
    Component, Condition, PulsarCluster, RequiredMetadata, REASON_ALL_SETS_READY, REASON_INVALID_SPEC, REASON_RECONCILE_ERROR,
    REASON_SETS_NOT_READY,
};
use pulsar_core::PULSAR_OPERATOR_LABEL_SELECTORS;

/// The annotation under which last-applied reconciliation state is persisted.
const LAST_APPLIED_ANNOTATION: &str = "pulsar.rs/last-applied";
/// The default timeout used for any K8s API operation.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// A unit of reconciliation work emitted by the watcher handlers.
pub enum ReconcileTask {
    /// A PulsarCluster was created or its spec changed.
    ClusterUpdated(Arc<String>),
    /// A PulsarCluster was deleted; its managed resources must go too.
    ClusterDeleted(Arc<String>, PulsarCluster),
}

impl Controller {
    /// Handle a reconciliation task from the task queue.
    #[tracing::instrument(level = "debug", skip(self, task))]
    pub(super) async fn handle_reconcile_task(&mut self, task: ReconcileTask) {
        match task {
            ReconcileTask::ClusterUpdated(name) => self.cluster_updated(name).await,
            ReconcileTask::ClusterDeleted(name, cluster) => self.cluster_deleted_cleanup(name, cluster).await,
        }
    }

    /// Run one reconciliation pass over the named cluster.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn cluster_updated(&mut self, name: Arc<String>) {
        // The cluster may have been deleted while this task sat in the queue.
        let cluster = match self.clusters.get(name.as_ref()) {
            Some(cluster) => cluster.clone(),
            None => return,
        };
        match self.reconcile_cluster(&cluster).await {
            Ok(outcome) => {
                if outcome.reschedule {
                    self.spawn_task(ReconcileTask::ClusterUpdated(name), true);
                }
            }
            Err(err) => {
                tracing::error!(error = ?err, cluster = %name, "error reconciling cluster");
                let condition = Condition::ready(false, REASON_RECONCILE_ERROR, err.to_string());
                if let Err(err) = self.patch_ready_condition(&cluster, condition).await {
                    tracing::error!(error = ?err, "error updating cluster status");
                }
                self.spawn_task(ReconcileTask::ClusterUpdated(name), true);
            }
        }
    }

    /// Reconcile every component of the given cluster, in rollout order.
    ///
    /// The last-applied snapshot is persisted even when a component fails
    /// partway, so work already applied is not re-diffed on the retry.
    async fn reconcile_cluster(&mut self, cluster: &PulsarCluster) -> Result<Outcome> {
        let mut defaulted = cluster.clone();
        defaulted.spec.apply_defaults();
        if let Err(err) = defaulted.spec.validate() {
            tracing::warn!(error = %err, cluster = %cluster.name(), "cluster spec failed validation");
            let condition = Condition::ready(false, REASON_INVALID_SPEC, err.to_string());
            self.patch_ready_condition(cluster, condition).await?;
            return Ok(Outcome::default());
        }

        let loaded = load_last_applied(cluster)?;
        let mut state = loaded.clone();
        let mut outcome = Outcome { ready: true, reschedule: false };
        let mut component_err = None;
        for &component in Component::ALL.iter() {
            let ctl = KubeSetController::new(self.client.clone(), cluster.namespace().to_string(), component);
            let entry = state.entry(component.as_str().to_string()).or_default();
            match reconcile_component(&ctl, &defaulted, entry).await {
                Ok(res) => {
                    outcome.ready &= res.ready;
                    outcome.reschedule |= res.reschedule;
                }
                Err(err) => {
                    component_err = Some(err.context(format!("error reconciling component {}", component.as_str())));
                    break;
                }
            }
        }
        if state != loaded {
            self.persist_last_applied(cluster, &state).await?;
        }
        if let Some(err) = component_err {
            return Err(err);
        }

        let condition = if outcome.ready {
            Condition::ready(true, REASON_ALL_SETS_READY, "all resource sets are ready")
        } else {
            Condition::ready(false, REASON_SETS_NOT_READY, "one or more resource sets are still converging")
        };
        self.patch_ready_condition(cluster, condition).await?;
        self.notify_daemons(&defaulted).await;
        Ok(outcome)
    }

    /// Persist the last-applied snapshot as an annotation on the cluster.
    async fn persist_last_applied(&self, cluster: &PulsarCluster, state: &BTreeMap<String, LastApplied>) -> Result<()> {
        let api: Api<PulsarCluster> = Api::namespaced(self.client.clone(), cluster.namespace());
        let serialized = serde_json::to_string(state).context("error serializing last-applied state")?;
        let patch = serde_json::json!({"metadata": {"annotations": {LAST_APPLIED_ANNOTATION: serialized}}});
        timeout(API_TIMEOUT, api.patch(cluster.name(), &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while persisting last-applied state")?
            .context("error persisting last-applied state")?;
        Ok(())
    }

    /// Patch the cluster's Ready condition, skipping the write when the
    /// observed status already carries an identical condition.
    async fn patch_ready_condition(&self, cluster: &PulsarCluster, condition: Condition) -> Result<()> {
        let current = cluster.status.as_ref().map(|status| status.conditions.as_slice()).unwrap_or_default();
        if current.len() == 1 && current[0] == condition {
            return Ok(());
        }
        let api: Api<PulsarCluster> = Api::namespaced(self.client.clone(), cluster.namespace());
        let patch = serde_json::json!({"status": {"conditions": [condition]}});
        timeout(API_TIMEOUT, api.patch_status(cluster.name(), &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while updating cluster status")?
            .context("error updating cluster status")?;
        Ok(())
    }

    /// Tear down everything the operator created for a deleted cluster.
    ///
    /// Deletion is best effort: a failed collection delete is logged and
    /// the remaining collections are still attempted, as the cluster object
    /// is already gone and there is nothing to retry against.
    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn cluster_deleted_cleanup(&mut self, name: Arc<String>, cluster: PulsarCluster) {
        self.daemons.forget(name.as_ref()).await;

        let namespace = cluster.namespace();
        let selector = format!("{},{}={}", PULSAR_OPERATOR_LABEL_SELECTORS, LABEL_PULSAR_RS_CLUSTER, name);
        let params = ListParams {
            label_selector: Some(selector),
            ..Default::default()
        };

        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        if let Err(err) = delete_collection(&statefulsets, &params).await {
            tracing::error!(error = ?err, cluster = %name, "error deleting cluster StatefulSets");
        }
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        if let Err(err) = delete_collection(&services, &params).await {
            tracing::error!(error = ?err, cluster = %name, "error deleting cluster Services");
        }
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        if let Err(err) = delete_collection(&configmaps, &params).await {
            tracing::error!(error = ?err, cluster = %name, "error deleting cluster ConfigMaps");
        }
    }
}

/// Deserialize the last-applied snapshot from the cluster's annotations.
///
/// A missing annotation is the first-reconciliation case and yields an
/// empty snapshot; an unparseable one is an error, as silently treating it
/// as empty would re-apply every set at once.
fn load_last_applied(cluster: &PulsarCluster) -> Result<BTreeMap<String, LastApplied>> {
    let raw = cluster
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(LAST_APPLIED_ANNOTATION));
    match raw {
        Some(raw) => serde_json::from_str(raw).context("error parsing last-applied annotation"),
        None => Ok(BTreeMap::new()),
    }
}

async fn delete_collection<K>(api: &Api<K>, params: &ListParams) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    timeout(API_TIMEOUT, api.delete_collection(&DeleteParams::default(), params))
        .await
        .context("timeout while deleting collection")?
        .context("error deleting collection")?;
    Ok(())
}
