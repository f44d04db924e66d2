//! Generic resource-set reconciliation engine.
//!
//! One `SetController` implementation exists per managed component kind
//! (zookeeper, bookkeeper, broker, proxy); the engine here drives all of
//! them through the same state machine. Per pass it diffs the declared spec
//! against the persisted last-applied state, patches only what actually
//! changed, and enforces the component's update strategy: under
//! RollingUpdate the first set which is not yet ready stops the pass so
//! later sets are left untouched until it stabilizes, bounding the blast
//! radius of a bad rollout. Parallel forfeits that guarantee in exchange
//! for faster convergence.
//!
//! A set's patch and its last-applied entry are treated as a unit: when the
//! patch fails, the in-memory state is not updated for that set, so the
//! next pass re-detects the change.

mod sets;
#[cfg(test)]
mod mod_test;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::diff;
use pulsar_core::crd::{PulsarCluster, UpdateStrategy};

pub use sets::KubeSetController;

/// The persisted snapshot of the most recently applied spec.
///
/// Owned exclusively by the reconciliation stream; autoscalers never read
/// or write it. Created empty on first reconciliation, updated after every
/// successful patch, entries removed when a set is deleted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastApplied {
    /// The spec slice last applied to the component's shared resources.
    #[serde(default)]
    pub common: Option<Value>,
    /// Per-set spec slices last applied, keyed by set name.
    #[serde(default)]
    pub sets: BTreeMap<String, Value>,
}

/// The result of one reconciliation pass over a component.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outcome {
    /// Whether every declared set ended the pass ready.
    pub ready: bool,
    /// Whether the pass should be re-run after a short delay.
    pub reschedule: bool,
}

impl Outcome {
    fn ready_now() -> Self {
        Self { ready: true, reschedule: false }
    }

    fn converging() -> Self {
        Self { ready: false, reschedule: true }
    }
}

/// The capabilities the engine needs from a managed component kind.
#[async_trait]
pub trait SetController: Send + Sync {
    /// The component's name, used in logs.
    fn component(&self) -> &'static str;

    /// The component's declared update strategy.
    fn strategy(&self, cluster: &PulsarCluster) -> UpdateStrategy;

    /// The declared set names, in spec order. This order IS the rollout
    /// order under RollingUpdate.
    fn set_names(&self, cluster: &PulsarCluster) -> Vec<String>;

    /// The comparable slice covering resources shared by every set.
    fn common_slice(&self, cluster: &PulsarCluster) -> Result<Value>;

    /// The comparable slice for one set, with every sibling set cleared so
    /// that one set's change cannot mask another's.
    fn set_slice(&self, cluster: &PulsarCluster, set: &str) -> Result<Value>;

    /// Apply the component's shared resources.
    async fn apply_common(&self, cluster: &PulsarCluster) -> Result<()>;

    /// Apply the managed resources of one set.
    async fn apply_set(&self, cluster: &PulsarCluster, set: &str) -> Result<()>;

    /// Delete the managed resources of a set no longer declared.
    async fn delete_set(&self, cluster: &PulsarCluster, set: &str) -> Result<()>;

    /// Whether all of the set's managed resources are ready & current.
    async fn set_ready(&self, cluster: &PulsarCluster, set: &str) -> Result<bool>;
}

/// Run one reconciliation pass for a component.
///
/// `state` is mutated in place as patches land; on transient API errors the
/// error propagates and any set whose patch failed keeps its previous
/// last-applied entry.
#[tracing::instrument(level = "debug", skip_all, fields(component = ctl.component()))]
pub async fn reconcile_component<C: SetController + ?Sized>(ctl: &C, cluster: &PulsarCluster, state: &mut LastApplied) -> Result<Outcome> {
    let strategy = ctl.strategy(cluster);

    // Shared/common resources are reconciled unconditionally, independent of
    // any per-set state.
    let declared_common = ctl.common_slice(cluster)?;
    let common_equal = match state.common.as_ref() {
        Some(last) => diff(last, &declared_common)?.is_equal(),
        None => false,
    };
    if !common_equal {
        ctl.apply_common(cluster).await?;
        state.common = Some(declared_common);
    }

    // Snapshot of previously-known sets, taken before any patch, so removed
    // sets are still detected even though they are absent from the declared
    // spec.
    let previous: Vec<String> = state.sets.keys().cloned().collect();

    let declared = ctl.set_names(cluster);
    let mut all_ready = true;
    for name in declared.iter() {
        let declared_slice = ctl.set_slice(cluster, name)?;
        let equal = match state.sets.get(name) {
            Some(last) => {
                let diff = diff(last, &declared_slice)?;
                if !diff.is_equal() {
                    tracing::debug!(set = %name, fields = %diff, "set spec drift detected");
                }
                diff.is_equal()
            }
            None => false,
        };

        if !equal {
            ctl.apply_set(cluster, name).await?;
            state.sets.insert(name.clone(), declared_slice);
        }
        if !ctl.set_ready(cluster, name).await? {
            all_ready = false;
            if strategy == UpdateStrategy::RollingUpdate {
                // Later sets are deliberately left untouched until this one
                // stabilizes.
                tracing::debug!(set = %name, "set not ready, holding rollout");
                return Ok(Outcome::converging());
            }
        }
    }

    if !all_ready {
        return Ok(Outcome::converging());
    }

    // Every declared set is ready; clean up sets which disappeared from the
    // declared spec, in last-applied order.
    for name in previous {
        if !declared.contains(&name) {
            ctl.delete_set(cluster, &name).await?;
            state.sets.remove(&name);
        }
    }
    Ok(Outcome::ready_now())
}
