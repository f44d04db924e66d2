//! Watcher event handlers feeding the reconciliation task queue.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::Resource;
use kube_runtime::watcher::Event;

use crate::factory::LABEL_PULSAR_RS_CLUSTER;
use crate::k8s::reconcile::ReconcileTask;
use crate::k8s::{Controller, EventResult};
use pulsar_core::crd::PulsarCluster;

//////////////////////////////////////////////////////////////////////////////
// PulsarCluster Events //////////////////////////////////////////////////////
impl Controller {
    /// Handle `PulsarCluster` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_cluster_event(&mut self, res: EventResult<PulsarCluster>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from PulsarCluster k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.cluster_applied(obj).await,
            Event::Deleted(obj) => self.cluster_deleted(obj).await,
            Event::Restarted(objs) => self.cluster_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn cluster_applied(&mut self, cluster: PulsarCluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.clusters.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &cluster {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.clusters.insert(name.clone(), cluster);
        self.spawn_task(ReconcileTask::ClusterUpdated(name), false);
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn cluster_deleted(&mut self, cluster: PulsarCluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, cluster) = match self.clusters.remove_entry(name_str) {
            Some((name, cluster)) => (name, cluster),
            None => return,
        };
        self.spawn_task(ReconcileTask::ClusterDeleted(name, cluster), false);
    }

    #[tracing::instrument(level = "debug", skip(self, clusters))]
    async fn cluster_restarted(&mut self, clusters: Vec<PulsarCluster>) {
        for cluster in clusters {
            self.cluster_applied(cluster).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// StatefulSet Events ////////////////////////////////////////////////////////
impl Controller {
    /// Handle `StatefulSet` watcher event.
    ///
    /// The operator keeps no StatefulSet cache; readiness is always read
    /// fresh during a pass. These events exist purely to requeue the owning
    /// cluster, so a set becoming ready unblocks the next rolling step
    /// without waiting out a reschedule delay.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_sts_event(&mut self, res: EventResult<StatefulSet>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from StatefulSet k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) | Event::Deleted(obj) => self.sts_changed(obj).await,
            Event::Restarted(objs) => {
                for obj in objs {
                    self.sts_changed(obj).await;
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, statefulset))]
    async fn sts_changed(&mut self, statefulset: StatefulSet) {
        let owner = statefulset
            .meta()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_PULSAR_RS_CLUSTER));
        let owner = match owner {
            Some(owner) => owner,
            None => return,
        };
        if let Some((name, _)) = self.clusters.get_key_value(owner) {
            self.spawn_task(ReconcileTask::ClusterUpdated(Arc::clone(name)), false);
        }
    }
}
