//! Background daemon wiring.
//!
//! Every successful reconciliation pass projects the cluster's defaulted
//! spec into a `DaemonSpec` and hands it to the scheduler. When the
//! projection is unchanged the running tasks are left alone; when it
//! changed the old generation is torn down and a fresh set of autoscalers
//! and the rack monitor is spawned from the new spec.

use std::time::Duration;

use kube::client::Client;

use crate::autoscale::{
    BookKeeperAutoscaler, BrokerAutoscaler, KubeScaleTarget, LoadReportUsage, MetricsApiUsage, ScalePolicy,
};
use crate::bookies::{DecommissionEngine, KubeBookieAdmin};
use crate::coordination::KubeCoordinationStore;
use crate::daemon::{DaemonTask, Periodic};
use crate::factory;
use crate::k8s::Controller;
use crate::rack::RackMonitor;
use pulsar_core::crd::{
    BrokerUsageSource, Component, PulsarCluster, PulsarClusterSpec, RequiredMetadata, SetBearing,
    DEFAULT_AUTOSCALE_PERIOD_SECONDS, DEFAULT_CPU_REQUEST_MILLIS,
};

/// The interval between rack monitor cycles.
const RACK_MONITOR_PERIOD: Duration = Duration::from_secs(60);

/// The daemon-relevant projection of a cluster.
///
/// The whole defaulted spec is carried rather than just the autoscaler
/// blocks: the rack monitor snapshots per-set replica counts, so a replica
/// change must rebuild the task set too.
#[derive(Clone, PartialEq)]
pub struct DaemonSpec {
    cluster: String,
    spec: PulsarClusterSpec,
}

impl Controller {
    /// Refresh the cluster's background daemons from its defaulted spec.
    pub(super) async fn notify_daemons(&mut self, cluster: &PulsarCluster) {
        let projection = DaemonSpec {
            cluster: cluster.name().to_string(),
            spec: cluster.spec.clone(),
        };
        let client = self.client.clone();
        let namespace = cluster.namespace().to_string();
        self.daemons
            .on_spec_change(cluster.name(), projection, |projection| build_tasks(client, &namespace, projection))
            .await;
    }
}

/// Build the full daemon task set for one cluster.
fn build_tasks(client: Client, namespace: &str, projection: &DaemonSpec) -> Vec<Periodic> {
    let cluster = projection.cluster.as_str();
    let spec = &projection.spec;
    let mut tasks = Vec::new();

    if let Some(autoscaler) = spec.broker.autoscaler.as_ref().filter(|autoscaler| autoscaler.enabled) {
        let period = Duration::from_secs(autoscaler.period_seconds.unwrap_or(DEFAULT_AUTOSCALE_PERIOD_SECONDS));
        let policy = ScalePolicy::for_broker(autoscaler);
        let explicit_sets = !spec.broker.sets.is_empty();
        for (set, _) in spec.broker.effective_sets() {
            let target = KubeScaleTarget::new(client.clone(), namespace, cluster, Component::Broker, &set, explicit_sets);
            let task: Box<dyn DaemonTask> = match autoscaler.usage_source {
                BrokerUsageSource::Metrics => {
                    let selector = factory::set_selector(cluster, Component::Broker, &set);
                    let cpu_request = autoscaler.cpu_request_millis.unwrap_or(DEFAULT_CPU_REQUEST_MILLIS);
                    let usage = MetricsApiUsage::new(client.clone(), namespace, selector, cpu_request);
                    Box::new(BrokerAutoscaler::new(&set, policy.clone(), target, usage))
                }
                BrokerUsageSource::LoadReport => {
                    let usage = LoadReportUsage::new(client.clone(), namespace);
                    Box::new(BrokerAutoscaler::new(&set, policy.clone(), target, usage))
                }
            };
            tasks.push(Periodic { period, task });
        }
    }

    if let Some(autoscaler) = spec.bookkeeper.autoscaler.as_ref().filter(|autoscaler| autoscaler.enabled) {
        let period = Duration::from_secs(autoscaler.period_seconds.unwrap_or(DEFAULT_AUTOSCALE_PERIOD_SECONDS));
        let policy = ScalePolicy::for_bookkeeper(autoscaler);
        let explicit_sets = !spec.bookkeeper.sets.is_empty();
        for (set, _) in spec.bookkeeper.effective_sets() {
            let target = KubeScaleTarget::new(client.clone(), namespace, cluster, Component::BookKeeper, &set, explicit_sets);
            let engine = DecommissionEngine::new(KubeBookieAdmin::new(client.clone(), namespace, cluster.to_string()));
            let task = BookKeeperAutoscaler::new(cluster, namespace, &set, policy.clone(), target, engine);
            tasks.push(Periodic { period, task: Box::new(task) });
        }
    }

    let store = KubeCoordinationStore::new(client.clone(), namespace, cluster);
    let monitor = RackMonitor::new(client, namespace, cluster, spec.clone(), store);
    tasks.push(Periodic { period: RACK_MONITOR_PERIOD, task: Box::new(monitor) });

    tasks
}
