use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{reconcile_component, LastApplied, SetController};
use pulsar_core::crd::{PulsarCluster, PulsarClusterSpec, UpdateStrategy};

/// A scripted in-memory component used to exercise the engine.
struct MockController {
    strategy: UpdateStrategy,
    order: Vec<String>,
    slices: BTreeMap<String, Value>,
    common: Value,
    ready: BTreeMap<String, bool>,
    fail_apply: Option<String>,
    log: Mutex<Vec<String>>,
}

impl MockController {
    fn new(strategy: UpdateStrategy, sets: &[(&str, Value)]) -> Self {
        Self {
            strategy,
            order: sets.iter().map(|(name, _)| name.to_string()).collect(),
            slices: sets.iter().map(|(name, slice)| (name.to_string(), slice.clone())).collect(),
            common: json!({"service": "cluster"}),
            ready: Default::default(),
            fail_apply: None,
            log: Mutex::new(vec![]),
        }
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().expect("poisoned log lock").push(entry.into());
    }

    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().expect("poisoned log lock"))
    }
}

#[async_trait]
impl SetController for MockController {
    fn component(&self) -> &'static str {
        "mock"
    }

    fn strategy(&self, _cluster: &PulsarCluster) -> UpdateStrategy {
        self.strategy
    }

    fn set_names(&self, _cluster: &PulsarCluster) -> Vec<String> {
        self.order.clone()
    }

    fn common_slice(&self, _cluster: &PulsarCluster) -> Result<Value> {
        Ok(self.common.clone())
    }

    fn set_slice(&self, _cluster: &PulsarCluster, set: &str) -> Result<Value> {
        self.record(format!("slice:{}", set));
        Ok(self.slices.get(set).cloned().unwrap_or(Value::Null))
    }

    async fn apply_common(&self, _cluster: &PulsarCluster) -> Result<()> {
        self.record("apply-common");
        Ok(())
    }

    async fn apply_set(&self, _cluster: &PulsarCluster, set: &str) -> Result<()> {
        if self.fail_apply.as_deref() == Some(set) {
            bail!("injected apply failure for {}", set);
        }
        self.record(format!("apply:{}", set));
        Ok(())
    }

    async fn delete_set(&self, _cluster: &PulsarCluster, set: &str) -> Result<()> {
        self.record(format!("delete:{}", set));
        Ok(())
    }

    async fn set_ready(&self, _cluster: &PulsarCluster, set: &str) -> Result<bool> {
        self.record(format!("ready:{}", set));
        Ok(*self.ready.get(set).unwrap_or(&true))
    }
}

fn cluster() -> PulsarCluster {
    PulsarCluster::new("test", PulsarClusterSpec::default())
}

#[tokio::test]
async fn second_pass_with_unchanged_spec_patches_nothing() -> Result<()> {
    let ctl = MockController::new(UpdateStrategy::RollingUpdate, &[("set1", json!({"replicas": 3})), ("set2", json!({"replicas": 2}))]);
    let cluster = cluster();
    let mut state = LastApplied::default();

    let outcome = reconcile_component(&ctl, &cluster, &mut state).await?;
    assert!(outcome.ready, "expected first pass to end ready");
    let log = ctl.take_log();
    assert!(log.contains(&"apply-common".to_string()), "expected common resources applied on first pass");
    assert!(log.contains(&"apply:set1".to_string()), "expected set1 applied on first pass");
    assert!(log.contains(&"apply:set2".to_string()), "expected set2 applied on first pass");

    let outcome = reconcile_component(&ctl, &cluster, &mut state).await?;
    assert!(outcome.ready, "expected second pass to end ready");
    let log = ctl.take_log();
    let patches: Vec<&String> = log.iter().filter(|entry| entry.starts_with("apply")).collect();
    assert!(patches.is_empty(), "expected no patches on second pass, got {:?}", patches);
    Ok(())
}

#[tokio::test]
async fn rolling_strategy_isolates_unready_set() -> Result<()> {
    let mut ctl = MockController::new(
        UpdateStrategy::RollingUpdate,
        &[("set1", json!({"replicas": 3})), ("set2", json!({"replicas": 5})), ("set3", json!({"replicas": 1}))],
    );
    ctl.ready.insert("set1".into(), false);
    let cluster = cluster();

    // set1 & set2 both drifted; set1 will not become ready after its patch.
    let mut state = LastApplied {
        common: Some(json!({"service": "cluster"})),
        sets: vec![
            ("set1".to_string(), json!({"replicas": 1})),
            ("set2".to_string(), json!({"replicas": 1})),
            ("set3".to_string(), json!({"replicas": 1})),
        ]
        .into_iter()
        .collect(),
    };

    let outcome = reconcile_component(&ctl, &cluster, &mut state).await?;
    assert!(outcome.reschedule, "expected reschedule while set1 converges");
    assert!(!outcome.ready, "expected not ready while set1 converges");

    let log = ctl.take_log();
    assert!(log.contains(&"apply:set1".to_string()), "expected set1 to be patched");
    let touched_later_sets: Vec<&String> = log.iter().filter(|entry| entry.contains("set2") || entry.contains("set3")).collect();
    assert!(touched_later_sets.is_empty(), "expected sets 2 & 3 untouched, got {:?}", touched_later_sets);
    Ok(())
}

#[tokio::test]
async fn parallel_strategy_patches_later_sets_past_an_unready_one() -> Result<()> {
    let mut ctl = MockController::new(UpdateStrategy::Parallel, &[("set1", json!({"replicas": 3})), ("set2", json!({"replicas": 5}))]);
    ctl.ready.insert("set1".into(), false);
    let cluster = cluster();
    let mut state = LastApplied { common: Some(json!({"service": "cluster"})), sets: Default::default() };

    let outcome = reconcile_component(&ctl, &cluster, &mut state).await?;
    assert!(outcome.reschedule && !outcome.ready, "expected a converging outcome");
    let log = ctl.take_log();
    assert!(log.contains(&"apply:set2".to_string()), "expected set2 patched under parallel strategy, got {:?}", log);
    Ok(())
}

#[tokio::test]
async fn removed_sets_are_deleted_only_once_all_ready() -> Result<()> {
    let ctl = MockController::new(UpdateStrategy::RollingUpdate, &[("set1", json!({"replicas": 3}))]);
    let cluster = cluster();
    let mut state = LastApplied {
        common: Some(json!({"service": "cluster"})),
        sets: vec![("set1".to_string(), json!({"replicas": 3})), ("legacy".to_string(), json!({"replicas": 9}))]
            .into_iter()
            .collect(),
    };

    let outcome = reconcile_component(&ctl, &cluster, &mut state).await?;
    assert!(outcome.ready, "expected pass to end ready");
    let log = ctl.take_log();
    assert!(log.contains(&"delete:legacy".to_string()), "expected removed set deleted, got {:?}", log);
    assert!(!state.sets.contains_key("legacy"), "expected removed set dropped from last-applied state");
    Ok(())
}

#[tokio::test]
async fn failed_patch_leaves_last_applied_untouched() -> Result<()> {
    let mut ctl = MockController::new(UpdateStrategy::RollingUpdate, &[("set1", json!({"replicas": 3}))]);
    ctl.fail_apply = Some("set1".into());
    let cluster = cluster();
    let mut state = LastApplied { common: Some(json!({"service": "cluster"})), sets: Default::default() };

    let res = reconcile_component(&ctl, &cluster, &mut state).await;
    assert!(res.is_err(), "expected the pass to propagate the apply failure");
    assert!(!state.sets.contains_key("set1"), "expected no last-applied entry for the failed set");
    Ok(())
}

#[tokio::test]
async fn common_resources_reconcile_independently_of_sets() -> Result<()> {
    let mut ctl = MockController::new(UpdateStrategy::RollingUpdate, &[("set1", json!({"replicas": 3}))]);
    ctl.ready.insert("set1".into(), false);
    let cluster = cluster();
    // Sets are unchanged but the common slice has never been applied.
    let mut state = LastApplied { common: None, sets: vec![("set1".to_string(), json!({"replicas": 3}))].into_iter().collect() };

    let outcome = reconcile_component(&ctl, &cluster, &mut state).await?;
    assert!(outcome.reschedule, "expected reschedule while set1 is unready");
    let log = ctl.take_log();
    assert!(log.contains(&"apply-common".to_string()), "expected common resources applied even with unready sets, got {:?}", log);
    assert!(state.common.is_some(), "expected common last-applied state recorded");
    Ok(())
}
