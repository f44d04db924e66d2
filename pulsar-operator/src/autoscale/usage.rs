//! Usage sampling sources for the broker autoscaler.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::client::Client;
use serde::Deserialize;
use tokio::time::timeout;

use super::Replica;
use pulsar_core::crd::Component;

const METRICS_TIMEOUT: Duration = Duration::from_secs(10);
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// A source of per-replica usage samples.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Percent usage for each of the given replicas.
    async fn sample(&self, replicas: &[Replica]) -> Result<Vec<f64>>;
}

/// CPU usage read from the Kubernetes metrics API, expressed as a percentage
/// of the configured per-pod CPU request.
pub struct MetricsApiUsage {
    client: Client,
    namespace: String,
    selector: String,
    cpu_request_millis: u64,
}

#[derive(Debug, Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetrics>,
}

#[derive(Debug, Deserialize)]
struct PodMetrics {
    metadata: PodMetricsMeta,
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsMeta {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    usage: ContainerUsage,
}

#[derive(Debug, Deserialize)]
struct ContainerUsage {
    cpu: String,
}

impl MetricsApiUsage {
    /// Create a new instance sampling the pods matched by the given selector.
    pub fn new(client: Client, namespace: &str, selector: String, cpu_request_millis: u64) -> Self {
        Self { client, namespace: namespace.to_string(), selector, cpu_request_millis }
    }

    async fn fetch(&self) -> Result<PodMetricsList> {
        let path = metrics_path(&self.namespace, &self.selector);
        let request = http::Request::get(path).body(Vec::new()).context("error building metrics API request")?;
        timeout(METRICS_TIMEOUT, self.client.request::<PodMetricsList>(request))
            .await
            .context("timeout while querying the metrics API")?
            .context("error querying the metrics API")
    }
}

/// Build the metrics API list path, encoding the label selector.
pub(super) fn metrics_path(namespace: &str, selector: &str) -> String {
    let target = format!("/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods?", namespace);
    let mut qp = form_urlencoded::Serializer::new(target);
    qp.append_pair("labelSelector", selector);
    qp.finish()
}

#[async_trait]
impl UsageSource for MetricsApiUsage {
    async fn sample(&self, replicas: &[Replica]) -> Result<Vec<f64>> {
        let metrics = self.fetch().await?;
        let mut samples = Vec::with_capacity(replicas.len());
        for replica in replicas {
            let pod = metrics
                .items
                .iter()
                .find(|item| item.metadata.name == replica.pod)
                .with_context(|| format!("no metrics reported for pod {}", replica.pod))?;
            let millis: f64 = pod
                .containers
                .iter()
                .map(|container| parse_cpu_millis(&container.usage.cpu))
                .sum::<Result<f64>>()?;
            samples.push(millis * 100.0 / self.cpu_request_millis as f64);
        }
        Ok(samples)
    }
}

/// Parse a Kubernetes CPU quantity into millicores.
pub(super) fn parse_cpu_millis(quantity: &str) -> Result<f64> {
    let quantity = quantity.trim();
    let (digits, factor) = if let Some(digits) = quantity.strip_suffix('n') {
        (digits, 1e-6)
    } else if let Some(digits) = quantity.strip_suffix('u') {
        (digits, 1e-3)
    } else if let Some(digits) = quantity.strip_suffix('m') {
        (digits, 1.0)
    } else {
        (quantity, 1000.0)
    };
    let value: f64 = digits.parse().with_context(|| format!("unparseable CPU quantity '{}'", quantity))?;
    Ok(value * factor)
}

/// CPU usage taken from the broker's own load report, fetched by exec'ing
/// `pulsar-admin broker-stats load-report` inside each broker pod.
pub struct LoadReportUsage {
    pods: Api<Pod>,
}

/// The slice of the broker load report this source cares about.
#[derive(Debug, Deserialize)]
struct LoadReport {
    cpu: ResourceUsageEntry,
}

#[derive(Debug, Deserialize)]
struct ResourceUsageEntry {
    usage: f64,
    limit: f64,
}

impl LoadReportUsage {
    /// Create a new instance.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { pods: Api::namespaced(client, namespace) }
    }
}

#[async_trait]
impl UsageSource for LoadReportUsage {
    async fn sample(&self, replicas: &[Replica]) -> Result<Vec<f64>> {
        let command = vec![
            "bin/pulsar-admin".to_string(),
            "broker-stats".to_string(),
            "load-report".to_string(),
        ];
        let mut samples = Vec::with_capacity(replicas.len());
        for replica in replicas {
            let output = crate::k8s::exec_pod(
                &self.pods,
                &replica.pod,
                Component::Broker.as_str(),
                command.clone(),
                EXEC_TIMEOUT,
            )
            .await?;
            let report: LoadReport = serde_json::from_str(&output)
                .with_context(|| format!("error parsing load report from pod {}", replica.pod))?;
            if report.cpu.limit <= 0.0 {
                bail!("load report from pod {} carries no CPU limit", replica.pod);
            }
            samples.push(report.cpu.usage * 100.0 / report.cpu.limit);
        }
        Ok(samples)
    }
}
