//! Kubernetes controller.
//!
//! This controller watches the PulsarCluster resources of its namespace along
//! with the StatefulSets the operator manages for them, and turns every
//! observed change into a reconciliation task. Tasks are processed one at a
//! time from a single queue, so reconciliation for a given cluster is always
//! strictly ordered; the background daemons spawned from here run
//! concurrently with that stream on the runtime.
//!
//! All writes go through K8s Server-Side Apply where possible: K8s will
//! reject a request to update a resource if the resource presented is not
//! the most up-to-date version known to the K8s API, which guards against
//! race conditions and stale local caches.

mod daemons;
mod data;
mod reconcile;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::client::Client;
use kube_runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::daemon::DaemonScheduler;
use crate::k8s::daemons::DaemonSpec;
use crate::k8s::reconcile::ReconcileTask;
use pulsar_core::crd::PulsarCluster;
use pulsar_core::PULSAR_OPERATOR_LABEL_SELECTORS;

/// The app name used by the operator.
pub(crate) const APP_NAME: &str = "pulsar-operator";
/// The timeout duration used before rescheduling a reconciliation task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Kubernetes controller for watching PulsarCluster CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of reconciliation tasks.
    tasks_tx: mpsc::Sender<ReconcileTask>,
    /// A channel of reconciliation tasks.
    tasks_rx: ReceiverStream<ReconcileTask>,

    /// All known PulsarCluster objects, by name.
    clusters: HashMap<Arc<String>, PulsarCluster>,
    /// The background daemons (autoscalers & rack monitors), per namespace.
    daemons: DaemonScheduler<DaemonSpec>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            clusters: Default::default(),
            daemons: DaemonScheduler::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams.
        let clusters: Api<PulsarCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let clusters_watcher = watcher(clusters, ListParams::default());
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let statefulsets_watcher = watcher(statefulsets, self.list_params_cluster_selector_labels());
        tokio::pin!(clusters_watcher, statefulsets_watcher);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = clusters_watcher.next() => self.handle_cluster_event(k8s_event_res).await,
                Some(k8s_event_res) = statefulsets_watcher.next() => self.handle_sts_event(k8s_event_res).await,
                Some(task) = self.tasks_rx.next() => self.handle_reconcile_task(task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        self.daemons.shutdown().await;
        drop(self.shutdown_tx);

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Spawn a task which emits a new reconciliation task.
    ///
    /// This indirection is used to ensure that we don't use an unlimited amount of memory with an
    /// unbounded queue, and also so that we do not block the controller from making progress and
    /// dead-locking when we hit the task queue cap.
    ///
    /// The runtime will stack up potentially lots of tasks, and memory will be consumed that way,
    /// but ultimately the controller will be able to begin processing reconciliation tasks and
    /// will drain the queue and relieve the memory pressure of the tasks.
    fn spawn_task(&self, task: ReconcileTask, is_retry: bool) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Create a list params object which selects only objects matching Pulsar labels.
    fn list_params_cluster_selector_labels(&self) -> ListParams {
        ListParams {
            label_selector: Some(PULSAR_OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        }
    }
}

/// Exec the given command inside the pod's named container and collect its
/// stdout. The command is bounded by `exec_timeout` end to end.
pub(crate) async fn exec_pod(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    command: Vec<String>,
    exec_timeout: Duration,
) -> Result<String> {
    let params = AttachParams::default().container(container).stdout(true).stderr(false);
    let fut = async {
        let mut attached = pods
            .exec(pod, command, &params)
            .await
            .with_context(|| format!("error exec'ing into pod {}", pod))?;
        let mut stdout = attached
            .stdout()
            .ok_or_else(|| anyhow!("exec returned no stdout stream"))?;
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.context("error reading exec stdout")?;
        // The attached process resolves with the status object from the
        // exec status channel once the connection terminates.
        if let Some(status) = attached.await {
            if status.status.as_deref() == Some("Failure") {
                return Err(anyhow!(
                    "exec'd command failed: {}",
                    status.message.unwrap_or_else(|| "no failure message".into())
                ));
            }
        }
        Ok::<String, anyhow::Error>(String::from_utf8_lossy(&buf).into_owned())
    };
    timeout(exec_timeout, fut).await.context("timeout while exec'ing into pod")?
}
