use anyhow::Result;

use super::*;
use crate::error::AppError;

fn spec_with_sets() -> PulsarClusterSpec {
    let mut spec = PulsarClusterSpec::default();
    spec.global.resource_sets.insert("zone-a".into(), ResourceSetMeta { rack: Some("us-east1-a".into()), ..Default::default() });
    spec.broker.sets.insert(
        "set1".into(),
        SetSpec { replicas: Some(5), resource_set: Some("zone-a".into()), ..Default::default() },
    );
    spec.broker.sets.insert("set2".into(), SetSpec::default());
    spec
}

#[test]
fn apply_defaults_is_idempotent_and_total() -> Result<()> {
    let mut spec = PulsarClusterSpec::default();
    spec.apply_defaults();
    let once = spec.clone();
    spec.apply_defaults();
    assert!(spec == once, "expected apply_defaults to be idempotent");

    assert!(spec.global.image.is_some(), "expected global image to be defaulted");
    assert!(spec.global.image_pull_policy.is_some(), "expected image pull policy to be defaulted");
    assert!(spec.global.cluster_domain.is_some(), "expected cluster domain to be defaulted");
    assert!(spec.zookeeper.replicas.is_some(), "expected zookeeper replicas to be defaulted");
    assert!(spec.zookeeper.storage_size.is_some(), "expected zookeeper storage size to be defaulted");
    assert!(spec.bookkeeper.storage_size.is_some(), "expected bookkeeper storage size to be defaulted");
    assert!(spec.broker.update_strategy.is_some(), "expected broker update strategy to be defaulted");
    assert!(spec.proxy.replicas.is_some(), "expected proxy replicas to be defaulted");
    Ok(())
}

#[test]
fn apply_defaults_resolves_autoscaler_fields() -> Result<()> {
    let mut spec = PulsarClusterSpec::default();
    spec.broker.autoscaler = Some(BrokerAutoscalerSpec { enabled: true, ..Default::default() });
    spec.bookkeeper.autoscaler = Some(BookKeeperAutoscalerSpec { enabled: true, ..Default::default() });
    spec.apply_defaults();

    let broker = spec.broker.autoscaler.as_ref().expect("broker autoscaler");
    assert!(broker.period_seconds.is_some(), "expected broker autoscale period to be defaulted");
    assert!(broker.high_usage_percent.is_some(), "expected broker high threshold to be defaulted");
    assert!(broker.min_replicas == Some(1), "expected broker min replicas default 1, got {:?}", broker.min_replicas);
    let bookie = spec.bookkeeper.autoscaler.as_ref().expect("bookkeeper autoscaler");
    assert!(bookie.stabilization_seconds.is_some(), "expected bookie stabilization window to be defaulted");
    Ok(())
}

#[test]
fn validate_accepts_wellformed_spec() -> Result<()> {
    let mut spec = spec_with_sets();
    spec.apply_defaults();
    spec.validate().map_err(|err| anyhow::anyhow!("unexpected validation error: {}", err))
}

#[test]
fn validate_rejects_unknown_resource_set() {
    let mut spec = spec_with_sets();
    spec.broker.sets.insert("set3".into(), SetSpec { resource_set: Some("nope".into()), ..Default::default() });
    let err = spec.validate().expect_err("expected validation to fail for unknown resource set");
    assert!(
        matches!(&err, AppError::InvalidSpec(msg) if msg.contains("nope")),
        "unexpected error returned: {:?}",
        err
    );
}

#[test]
fn validate_rejects_inverted_thresholds() {
    let mut spec = PulsarClusterSpec::default();
    spec.broker.autoscaler = Some(BrokerAutoscalerSpec {
        enabled: true,
        high_usage_percent: Some(20.0),
        low_usage_percent: Some(80.0),
        ..Default::default()
    });
    let err = spec.validate().expect_err("expected validation to fail for inverted thresholds");
    assert!(matches!(err, AppError::InvalidSpec(_)), "unexpected error returned: {:?}", err);
}

#[test]
fn validate_rejects_zero_min_replicas() {
    let mut spec = PulsarClusterSpec::default();
    spec.bookkeeper.autoscaler = Some(BookKeeperAutoscalerSpec { enabled: true, min_replicas: Some(0), ..Default::default() });
    let err = spec.validate().expect_err("expected validation to fail for zero min replicas");
    assert!(matches!(err, AppError::InvalidSpec(_)), "unexpected error returned: {:?}", err);
}

#[test]
fn effective_sets_synthesizes_default_set() -> Result<()> {
    let mut spec = PulsarClusterSpec::default();
    spec.broker.replicas = Some(4);
    let sets = spec.broker.effective_sets();
    assert!(sets.len() == 1, "expected a single implicit set, got {}", sets.len());
    assert!(sets[0].0 == DEFAULT_SET, "expected implicit set to be named {:?}, got {:?}", DEFAULT_SET, sets[0].0);
    assert!(sets[0].1.replicas == Some(4), "expected implicit set replicas 4, got {:?}", sets[0].1.replicas);
    Ok(())
}

#[test]
fn effective_sets_follow_declaration_order() -> Result<()> {
    let mut spec = PulsarClusterSpec::default();
    spec.broker.sets.insert("zone-b".into(), SetSpec::default());
    spec.broker.sets.insert("zone-a".into(), SetSpec::default());
    let names: Vec<String> = spec.broker.effective_sets().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["zone-b", "zone-a"], "expected rollout order to follow declaration order");
    Ok(())
}

#[test]
fn effective_sets_resolves_replica_fallback() -> Result<()> {
    let mut spec = spec_with_sets();
    spec.broker.replicas = Some(2);
    let sets = spec.broker.effective_sets();
    assert!(sets.len() == 2, "expected two declared sets, got {}", sets.len());
    let set1 = sets.iter().find(|(name, _)| name == "set1").expect("set1 missing");
    let set2 = sets.iter().find(|(name, _)| name == "set2").expect("set2 missing");
    assert!(set1.1.replicas == Some(5), "expected set1 replicas 5, got {:?}", set1.1.replicas);
    assert!(set2.1.replicas == Some(2), "expected set2 replicas to fall back to 2, got {:?}", set2.1.replicas);
    Ok(())
}
