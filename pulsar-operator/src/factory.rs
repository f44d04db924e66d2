//! Builders for the K8s objects backing each component resource set.
//!
//! These builders are deliberately thin: the reconciliation engine only
//! cares that a set maps to one StatefulSet plus a shared Service per
//! component, and that rebuilding from an unchanged spec yields an
//! identical object.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Service,
    ServicePort, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::Resource;

use pulsar_core::crd::{Component, PulsarCluster, RequiredMetadata, SetSpec};

/// The canonical label identifying a cluster's pods & child resources.
pub const LABEL_PULSAR_RS_CLUSTER: &str = "pulsar.rs/cluster";
/// The canonical label identifying a component.
pub const LABEL_PULSAR_RS_COMPONENT: &str = "pulsar.rs/component";
/// The canonical label identifying a resource set.
pub const LABEL_PULSAR_RS_SET: &str = "pulsar.rs/set";

/// The location where bookies place their journal & ledger data.
pub const BOOKIE_DATA_PATH: &str = "/pulsar/data/bookkeeper";
/// The location where zookeeper servers place their data.
const ZK_DATA_PATH: &str = "/pulsar/data/zookeeper";

/// The port bookies serve on; part of each bookie's identity.
pub const BOOKIE_PORT: i32 = 3181;
const ZK_CLIENT_PORT: i32 = 2181;
const ZK_PEER_PORT: i32 = 2888;
const ZK_ELECTION_PORT: i32 = 3888;
const BOOKIE_HTTP_PORT: i32 = 8000;
const PULSAR_PORT: i32 = 6650;
const PULSAR_HTTP_PORT: i32 = 8080;

/// The name of the StatefulSet backing one component set.
pub fn sts_name(cluster: &str, component: Component, set: &str) -> String {
    format!("{}-{}-{}", cluster, component.as_str(), set)
}

/// The name of the component's shared Service.
pub fn service_name(cluster: &str, component: Component) -> String {
    format!("{}-{}", cluster, component.as_str())
}

/// Set the canonical labels on an object controlled by the operator.
pub fn set_canonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), "pulsar".into());
    labels.insert("pulsar.rs/controlled-by".into(), "pulsar-operator".into());
}

fn component_ports(component: Component) -> Vec<(&'static str, i32)> {
    match component {
        Component::ZooKeeper => vec![("client", ZK_CLIENT_PORT), ("peer", ZK_PEER_PORT), ("leader-election", ZK_ELECTION_PORT)],
        Component::BookKeeper => vec![("bookie", BOOKIE_PORT), ("http", BOOKIE_HTTP_PORT)],
        Component::Broker | Component::Proxy => vec![("pulsar", PULSAR_PORT), ("http", PULSAR_HTTP_PORT)],
    }
}

fn component_command(component: Component) -> Vec<String> {
    let role = match component {
        Component::ZooKeeper => "zookeeper",
        Component::BookKeeper => "bookie",
        Component::Broker => "broker",
        Component::Proxy => "proxy",
    };
    vec!["bin/pulsar".into(), role.into()]
}

fn storage_size(cluster: &PulsarCluster, component: Component) -> Option<String> {
    match component {
        Component::ZooKeeper => cluster.spec.zookeeper.storage_size.clone(),
        Component::BookKeeper => cluster.spec.bookkeeper.storage_size.clone(),
        Component::Broker | Component::Proxy => None,
    }
}

fn node_selector(cluster: &PulsarCluster, component: Component, set: &SetSpec) -> Option<BTreeMap<String, String>> {
    let mut selector = cluster.spec.global.node_selector.clone();
    let pod = match component {
        Component::ZooKeeper => cluster.spec.zookeeper.pod.as_ref(),
        Component::BookKeeper => cluster.spec.bookkeeper.pod.as_ref(),
        Component::Broker => cluster.spec.broker.pod.as_ref(),
        Component::Proxy => cluster.spec.proxy.pod.as_ref(),
    };
    if let Some(pod) = pod {
        selector.extend(pod.node_selector.clone());
    }
    if let Some(meta) = set.resource_set.as_deref().and_then(|name| cluster.spec.global.resource_sets.get(name)) {
        selector.extend(meta.node_selector.clone());
    }
    selector.extend(set.node_selector.clone());
    if selector.is_empty() {
        None
    } else {
        Some(selector)
    }
}

fn pod_resources(cluster: &PulsarCluster, component: Component) -> Option<ResourceRequirements> {
    let pod = match component {
        Component::ZooKeeper => cluster.spec.zookeeper.pod.as_ref(),
        Component::BookKeeper => cluster.spec.bookkeeper.pod.as_ref(),
        Component::Broker => cluster.spec.broker.pod.as_ref(),
        Component::Proxy => cluster.spec.proxy.pod.as_ref(),
    }?;
    let mut requests = BTreeMap::new();
    if let Some(cpu) = pod.cpu.as_ref() {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = pod.memory.as_ref() {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if requests.is_empty() {
        return None;
    }
    Some(ResourceRequirements { requests: Some(requests), ..Default::default() })
}

/// Build the StatefulSet backing one resource set of a component.
pub fn build_statefulset(cluster: &PulsarCluster, component: Component, set_name: &str, set: &SetSpec) -> StatefulSet {
    tracing::debug!(cluster = cluster.name(), %component, set = set_name, "building statefulset for resource set");

    // Build metadata.
    let mut sts = StatefulSet::default();
    let labels = sts.meta_mut().labels.get_or_insert_with(Default::default);
    set_canonical_labels(labels);
    labels.insert(LABEL_PULSAR_RS_CLUSTER.into(), cluster.name().into());
    labels.insert(LABEL_PULSAR_RS_COMPONENT.into(), component.as_str().into());
    labels.insert(LABEL_PULSAR_RS_SET.into(), set_name.into());
    let labels = labels.clone(); // Used below.
    sts.meta_mut().namespace = cluster.meta().namespace.clone();
    sts.meta_mut().name = Some(sts_name(cluster.name(), component, set_name));

    // Build spec.
    let spec = sts.spec.get_or_insert_with(Default::default);
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: None,
    });
    spec.service_name = service_name(cluster.name(), component);
    spec.replicas = set.replicas.map(|replicas| replicas as i32);
    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };
    let probe_port = component_ports(component)[0].1;
    spec.template = PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(30),
            node_selector: node_selector(cluster, component, set),
            containers: vec![Container {
                name: component.as_str().into(),
                image: Some(cluster.spec.global.image().into()),
                image_pull_policy: Some(cluster.spec.global.image_pull_policy().into()),
                command: Some(component_command(component)),
                ports: Some(
                    component_ports(component)
                        .into_iter()
                        .map(|(name, port)| ContainerPort {
                            name: Some(name.into()),
                            container_port: port,
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                resources: pod_resources(cluster, component),
                readiness_probe: Some(Probe {
                    initial_delay_seconds: Some(5),
                    period_seconds: Some(10),
                    tcp_socket: Some(TCPSocketAction { port: IntOrString::Int(probe_port), host: None }),
                    ..Default::default()
                }),
                liveness_probe: Some(Probe {
                    initial_delay_seconds: Some(15),
                    period_seconds: Some(20),
                    tcp_socket: Some(TCPSocketAction { port: IntOrString::Int(probe_port), host: None }),
                    ..Default::default()
                }),
                volume_mounts: storage_size(cluster, component).map(|_| {
                    vec![k8s_openapi::api::core::v1::VolumeMount {
                        name: "data".into(),
                        mount_path: match component {
                            Component::ZooKeeper => ZK_DATA_PATH.into(),
                            _ => BOOKIE_DATA_PATH.into(),
                        },
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
    };

    // Build volume claim templates for the stateful components.
    if let Some(size) = storage_size(cluster, component) {
        spec.volume_claim_templates = Some(vec![PersistentVolumeClaim {
            metadata: ObjectMeta { name: Some("data".into()), ..Default::default() },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                storage_class_name: cluster.spec.global.storage_class.clone(),
                resources: Some(ResourceRequirements {
                    requests: Some(maplit::btreemap! {
                        "storage".into() => Quantity(size),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    sts
}

/// Build the shared Service fronting every set of a component.
///
/// Stateful components get a headless Service so peers address each other by
/// stable DNS names; the serving layers get a regular ClusterIP endpoint.
pub fn build_component_service(cluster: &PulsarCluster, component: Component) -> Service {
    tracing::debug!(cluster = cluster.name(), %component, "building shared service for component");

    // Build metadata.
    let mut service = Service::default();
    let labels = service.meta_mut().labels.get_or_insert_with(Default::default);
    set_canonical_labels(labels);
    labels.insert(LABEL_PULSAR_RS_CLUSTER.into(), cluster.name().into());
    labels.insert(LABEL_PULSAR_RS_COMPONENT.into(), component.as_str().into());
    service.meta_mut().namespace = cluster.meta().namespace.clone();
    service.meta_mut().name = Some(service_name(cluster.name(), component));

    // Build spec.
    let spec = service.spec.get_or_insert_with(Default::default);
    let selector = spec.selector.get_or_insert_with(Default::default);
    set_canonical_labels(selector);
    selector.insert(LABEL_PULSAR_RS_CLUSTER.into(), cluster.name().into());
    selector.insert(LABEL_PULSAR_RS_COMPONENT.into(), component.as_str().into());
    spec.type_ = Some("ClusterIP".into());
    if matches!(component, Component::ZooKeeper | Component::BookKeeper) {
        spec.cluster_ip = Some("None".into());
    }
    spec.ports = Some(
        component_ports(component)
            .into_iter()
            .map(|(name, port)| ServicePort {
                name: Some(name.into()),
                port,
                protocol: Some("TCP".into()),
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            })
            .collect(),
    );

    service
}

/// The label selector matching every pod of one component resource set.
pub fn set_selector(cluster: &str, component: Component, set: &str) -> String {
    format!(
        "{}={},{}={},{}={}",
        LABEL_PULSAR_RS_CLUSTER, cluster, LABEL_PULSAR_RS_COMPONENT, component.as_str(), LABEL_PULSAR_RS_SET, set
    )
}
