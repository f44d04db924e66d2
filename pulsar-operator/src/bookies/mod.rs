//! Bookie administrative operations.
//!
//! The decommission engine and the disk autoscaler talk to BookKeeper through
//! the `BookieAdmin` capability trait; the Kube-backed implementation drives
//! the bookie HTTP admin endpoint and the `bookkeeper shell` by exec'ing into
//! the bookie pods.

mod decommission;
#[cfg(test)]
mod decommission_test;
#[cfg(test)]
mod mod_test;

pub use decommission::DecommissionEngine;

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use serde::Deserialize;
use tokio::time::timeout;

use crate::factory;
use pulsar_core::crd::Component;

/// The timeout for commands exec'd inside a bookie pod. Recovery relocates
/// ledger data and can legitimately run for a while.
const EXEC_TIMEOUT: Duration = Duration::from_secs(600);

/// The bookie HTTP admin port, reachable only from inside the pod.
const BOOKIE_HTTP_PORT: i32 = 8000;

/// One bookie replica, addressed both as a pod and by its bookie ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bookie {
    /// The pod backing this bookie.
    pub pod: String,
    /// The bookie's ID as registered in the BookKeeper metadata,
    /// `<pod>.<service>.<namespace>:<port>`.
    pub id: String,
}

impl Bookie {
    /// Address one replica of the given cluster's bookie StatefulSet.
    pub fn new(cluster: &str, namespace: &str, set: &str, ordinal: u32) -> Self {
        let pod = format!("{}-{}", factory::sts_name(cluster, Component::BookKeeper, set), ordinal);
        let service = factory::service_name(cluster, Component::BookKeeper);
        let id = format!("{}.{}.{}:{}", pod, service, namespace, factory::BOOKIE_PORT);
        Self { pod, id }
    }
}

/// Usage numbers for one of a bookie's ledger disks.
#[derive(Clone, Debug)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
}

impl DiskUsage {
    /// Used fraction of the disk as a percentage.
    pub fn percent(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 * 100.0 / self.max_bytes as f64
    }
}

/// A point-in-time usage & state sample for one bookie, read fresh on every
/// autoscaler cycle and never persisted.
#[derive(Clone, Debug)]
pub struct BookieStats {
    pub writable: bool,
    pub disks: Vec<DiskUsage>,
}

impl BookieStats {
    /// The bookie's disk-usage percent, the max across its disks.
    pub fn disk_usage_percent(&self) -> f64 {
        self.disks.iter().map(DiskUsage::percent).fold(0.0, f64::max)
    }
}

/// Administrative operations against a BookKeeper deployment.
#[async_trait]
pub trait BookieAdmin: Send + Sync {
    /// Read the bookie's writability and disk usage.
    async fn stats(&self, bookie: &Bookie) -> Result<BookieStats>;

    /// Flip the bookie's read-only state.
    async fn set_read_only(&self, bookie: &Bookie, read_only: bool) -> Result<()>;

    /// Recover and relocate the bookie's ledger data onto other bookies,
    /// leaving its cookie in place. Returns the operation's textual result.
    async fn recover(&self, bookie: &Bookie) -> Result<String>;

    /// The ledgers still assigned to the bookie.
    async fn list_ledgers(&self, bookie: &Bookie) -> Result<Vec<u64>>;

    /// Whether the cluster-wide audit reports any under-replicated ledgers.
    async fn has_under_replicated_ledgers(&self) -> Result<bool>;

    /// Delete the bookie's cookie from the metadata store. Returns the
    /// operation's textual result.
    async fn delete_cookie(&self, bookie: &Bookie) -> Result<String>;

    /// Remove the bookie's on-disk cookie artifact.
    async fn delete_cookie_file(&self, bookie: &Bookie) -> Result<()>;
}

/// `BookieAdmin` bound to the K8s API of one cluster's bookie pods.
pub struct KubeBookieAdmin {
    pods: Api<Pod>,
    cluster: String,
}

/// Payload of `GET /api/v1/bookie/state` on the bookie HTTP port.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookieStateResponse {
    #[serde(default)]
    read_only: bool,
}

/// Payload of `GET /api/v1/bookie/info` on the bookie HTTP port.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookieInfoResponse {
    free_space: u64,
    total_space: u64,
}

impl KubeBookieAdmin {
    /// Create a new instance.
    pub fn new(client: Client, namespace: &str, cluster: String) -> Self {
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        Self { pods, cluster }
    }

    /// Exec the given command inside the pod's bookkeeper container and
    /// collect its stdout.
    async fn exec(&self, pod: &str, command: Vec<String>) -> Result<String> {
        crate::k8s::exec_pod(&self.pods, pod, Component::BookKeeper.as_str(), command, EXEC_TIMEOUT).await
    }

    /// Call the bookie's local HTTP admin endpoint from inside the pod.
    async fn http(&self, pod: &str, method: &str, path: &str, body: Option<&str>) -> Result<String> {
        let mut command = vec![
            "curl".to_string(),
            "-sS".to_string(),
            "-X".to_string(),
            method.to_string(),
            format!("http://localhost:{}{}", BOOKIE_HTTP_PORT, path),
        ];
        if let Some(body) = body {
            command.push("-d".to_string());
            command.push(body.to_string());
        }
        self.exec(pod, command).await
    }

    /// Any running bookie pod of this cluster, used for cluster-scoped shell
    /// commands that are not tied to a specific bookie.
    async fn any_bookie_pod(&self) -> Result<String> {
        let selector = format!(
            "{},{}={},{}={}",
            pulsar_core::PULSAR_OPERATOR_LABEL_SELECTORS,
            factory::LABEL_PULSAR_RS_CLUSTER,
            self.cluster,
            factory::LABEL_PULSAR_RS_COMPONENT,
            Component::BookKeeper.as_str(),
        );
        let pods = timeout(EXEC_TIMEOUT, self.pods.list(&ListParams::default().labels(&selector)))
            .await
            .context("timeout while listing bookie pods")?
            .context("error listing bookie pods")?;
        pods.items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .next()
            .ok_or_else(|| anyhow!("no bookie pods found for cluster {}", self.cluster))
    }
}

#[async_trait]
impl BookieAdmin for KubeBookieAdmin {
    async fn stats(&self, bookie: &Bookie) -> Result<BookieStats> {
        let state = self.http(&bookie.pod, "GET", "/api/v1/bookie/state", None).await?;
        let state: BookieStateResponse =
            serde_json::from_str(&state).context("error parsing bookie state response")?;
        let info = self.http(&bookie.pod, "GET", "/api/v1/bookie/info", None).await?;
        let info: BookieInfoResponse =
            serde_json::from_str(&info).context("error parsing bookie info response")?;
        Ok(BookieStats {
            writable: !state.read_only,
            disks: vec![DiskUsage {
                used_bytes: info.total_space.saturating_sub(info.free_space),
                max_bytes: info.total_space,
            }],
        })
    }

    async fn set_read_only(&self, bookie: &Bookie, read_only: bool) -> Result<()> {
        let body = serde_json::json!({ "readOnly": read_only }).to_string();
        self.http(&bookie.pod, "PUT", "/api/v1/bookie/state/readonly", Some(&body))
            .await
            .map(|_| ())
    }

    async fn recover(&self, bookie: &Bookie) -> Result<String> {
        self.exec(
            &bookie.pod,
            shell_command(&["recover", "-force", &bookie.id]),
        )
        .await
    }

    async fn list_ledgers(&self, bookie: &Bookie) -> Result<Vec<u64>> {
        let output = self
            .exec(&bookie.pod, shell_command(&["listledgers", "-bookieid", &bookie.id]))
            .await?;
        Ok(parse_ledger_ids(&output))
    }

    async fn has_under_replicated_ledgers(&self) -> Result<bool> {
        let pod = self.any_bookie_pod().await?;
        let output = self.exec(&pod, shell_command(&["listunderreplicated"])).await?;
        Ok(!parse_ledger_ids(&output).is_empty())
    }

    async fn delete_cookie(&self, bookie: &Bookie) -> Result<String> {
        let pod = self.any_bookie_pod().await?;
        self.exec(&pod, shell_command(&["cookie", "delete", &bookie.id])).await
    }

    async fn delete_cookie_file(&self, bookie: &Bookie) -> Result<()> {
        let path = format!("{}/journal/current/VERSION", factory::BOOKIE_DATA_PATH);
        let output = self
            .exec(&bookie.pod, vec!["rm".to_string(), "-f".to_string(), path])
            .await?;
        if !output.trim().is_empty() {
            bail!("unexpected output deleting cookie file on {}: {}", bookie.pod, output.trim());
        }
        Ok(())
    }
}

fn shell_command(args: &[&str]) -> Vec<String> {
    let mut command = vec!["bin/bookkeeper".to_string(), "shell".to_string()];
    command.extend(args.iter().map(|arg| arg.to_string()));
    command
}

/// Extract the ledger IDs from `listledgers`/`listunderreplicated` output.
///
/// The shell prints one `ledgerID: <id>` line per ledger amid unrelated log
/// noise; anything else is ignored.
fn parse_ledger_ids(output: &str) -> Vec<u64> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let id = line.strip_prefix("ledgerID:").map(str::trim)?;
            id.parse().ok()
        })
        .collect()
}
