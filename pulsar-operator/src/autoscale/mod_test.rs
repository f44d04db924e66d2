use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use super::{
    next_replicas, BookKeeperAutoscaler, BrokerAutoscaler, Replica, ScalePolicy, ScaleTarget, UsageSource,
};
use crate::bookies::{Bookie, BookieAdmin, BookieStats, DecommissionEngine, DiskUsage};

fn policy() -> ScalePolicy {
    ScalePolicy {
        high_usage_percent: 80.0,
        low_usage_percent: 20.0,
        scale_up_by: 1,
        scale_down_by: 1,
        min_replicas: 1,
        max_replicas: None,
        stabilization: Duration::from_secs(300),
    }
}

/// Replicas that started well outside any stabilization window.
fn settled_replicas(count: usize) -> Vec<Replica> {
    (0..count)
        .map(|ordinal| Replica {
            pod: format!("test-broker-default-{}", ordinal),
            started_at: Some(Utc::now() - ChronoDuration::hours(1)),
        })
        .collect()
}

struct MockTarget {
    replicas: Option<Vec<Replica>>,
    patched: Mutex<Option<u32>>,
}

impl MockTarget {
    fn new(replicas: Option<Vec<Replica>>) -> Self {
        Self { replicas, patched: Mutex::new(None) }
    }

    fn patched(&self) -> Option<u32> {
        *self.patched.lock().unwrap()
    }
}

#[async_trait]
impl ScaleTarget for &MockTarget {
    async fn observe(&self) -> Result<Option<Vec<Replica>>> {
        Ok(self.replicas.clone())
    }

    async fn patch_replicas(&self, replicas: u32) -> Result<()> {
        *self.patched.lock().unwrap() = Some(replicas);
        Ok(())
    }
}

struct FixedUsage(f64);

#[async_trait]
impl UsageSource for FixedUsage {
    async fn sample(&self, replicas: &[Replica]) -> Result<Vec<f64>> {
        Ok(replicas.iter().map(|_| self.0).collect())
    }
}

struct FailingUsage;

#[async_trait]
impl UsageSource for FailingUsage {
    async fn sample(&self, _replicas: &[Replica]) -> Result<Vec<f64>> {
        bail!("usage must not be sampled in this scenario")
    }
}

#[test]
fn replica_proposals_respect_hysteresis_and_bounds() -> Result<()> {
    let base = policy();
    // The documented examples.
    assert_eq!(next_replicas(&base, 3, 90.0), 4, "expected scale-up to 4");
    assert_eq!(next_replicas(&base, 3, 10.0), 2, "expected scale-down to 2");
    assert_eq!(next_replicas(&base, 1, 10.0), 1, "expected the floor to hold at 1");
    // Between the thresholds nothing moves, threshold values included.
    assert_eq!(next_replicas(&base, 3, 50.0), 3, "expected no change at 50%");
    assert_eq!(next_replicas(&base, 3, 80.0), 3, "expected no change at the high threshold");
    assert_eq!(next_replicas(&base, 3, 20.0), 3, "expected no change at the low threshold");

    let bounded = ScalePolicy { min_replicas: 3, max_replicas: Some(5), ..base };
    assert_eq!(next_replicas(&bounded, 5, 95.0), 5, "expected the ceiling to hold at 5");
    assert_eq!(next_replicas(&bounded, 3, 5.0), 3, "expected the floor to hold at 3");
    // A count already outside the bounds never moves against its branch.
    assert_eq!(next_replicas(&bounded, 7, 95.0), 7, "a count above the ceiling must not shrink on scale-up");
    assert_eq!(next_replicas(&bounded, 2, 5.0), 2, "a count below the floor must not grow on scale-down");
    Ok(())
}

#[tokio::test]
async fn high_usage_scales_the_broker_set_up() -> Result<()> {
    let target = MockTarget::new(Some(settled_replicas(3)));
    let scaler = BrokerAutoscaler::new("default", policy(), &target, FixedUsage(90.0));
    scaler.cycle().await?;
    assert_eq!(target.patched(), Some(4), "expected a patch to 4 replicas, got {:?}", target.patched());
    Ok(())
}

#[tokio::test]
async fn usage_between_thresholds_patches_nothing() -> Result<()> {
    let target = MockTarget::new(Some(settled_replicas(3)));
    let scaler = BrokerAutoscaler::new("default", policy(), &target, FixedUsage(50.0));
    scaler.cycle().await?;
    assert_eq!(target.patched(), None, "expected no patch, got {:?}", target.patched());
    Ok(())
}

#[tokio::test]
async fn an_unready_workload_suppresses_the_cycle() -> Result<()> {
    let target = MockTarget::new(None);
    let scaler = BrokerAutoscaler::new("default", policy(), &target, FailingUsage);
    scaler.cycle().await?;
    assert_eq!(target.patched(), None, "expected no patch, got {:?}", target.patched());
    Ok(())
}

#[tokio::test]
async fn a_fresh_replica_suppresses_the_cycle() -> Result<()> {
    let mut replicas = settled_replicas(3);
    replicas[2].started_at = Some(Utc::now());
    let target = MockTarget::new(Some(replicas));
    let scaler = BrokerAutoscaler::new("default", policy(), &target, FailingUsage);
    scaler.cycle().await?;
    assert_eq!(target.patched(), None, "expected no patch, got {:?}", target.patched());
    Ok(())
}

#[tokio::test]
async fn an_unscheduled_replica_suppresses_the_cycle() -> Result<()> {
    let mut replicas = settled_replicas(3);
    replicas[1].started_at = None;
    let target = MockTarget::new(Some(replicas));
    let scaler = BrokerAutoscaler::new("default", policy(), &target, FailingUsage);
    scaler.cycle().await?;
    assert_eq!(target.patched(), None, "expected no patch, got {:?}", target.patched());
    Ok(())
}

/// Bookie admin with fixed disk usage; cookie deletion fails for the listed
/// bookies, all other operations succeed.
struct ScriptedAdmin {
    disk_usage_percent: f64,
    fail_cookie_for: Vec<String>,
}

#[async_trait]
impl BookieAdmin for ScriptedAdmin {
    async fn stats(&self, _bookie: &Bookie) -> Result<BookieStats> {
        Ok(BookieStats {
            writable: true,
            disks: vec![DiskUsage {
                used_bytes: self.disk_usage_percent as u64,
                max_bytes: 100,
            }],
        })
    }

    async fn set_read_only(&self, _bookie: &Bookie, _read_only: bool) -> Result<()> {
        Ok(())
    }

    async fn recover(&self, _bookie: &Bookie) -> Result<String> {
        Ok("Recover bookie operation completed with rc: OK: No problem".to_string())
    }

    async fn list_ledgers(&self, _bookie: &Bookie) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }

    async fn has_under_replicated_ledgers(&self) -> Result<bool> {
        Ok(false)
    }

    async fn delete_cookie(&self, bookie: &Bookie) -> Result<String> {
        if self.fail_cookie_for.contains(&bookie.id) {
            bail!("metadata store unavailable");
        }
        Ok("Successfully deleted the cookie".to_string())
    }

    async fn delete_cookie_file(&self, _bookie: &Bookie) -> Result<()> {
        Ok(())
    }
}

fn bookkeeper_scaler<'a>(
    target: &'a MockTarget,
    policy: ScalePolicy,
    admin: ScriptedAdmin,
) -> BookKeeperAutoscaler<&'a MockTarget, ScriptedAdmin> {
    let engine = DecommissionEngine::with_settle_delay(admin, Duration::from_millis(0));
    BookKeeperAutoscaler::new("test", "pulsar", "default", policy, target, engine)
}

#[tokio::test]
async fn low_disk_usage_decommissions_then_scales_down() -> Result<()> {
    let replicas = (0..3)
        .map(|ordinal| Replica {
            pod: format!("test-bookkeeper-default-{}", ordinal),
            started_at: Some(Utc::now() - ChronoDuration::hours(1)),
        })
        .collect();
    let target = MockTarget::new(Some(replicas));
    let admin = ScriptedAdmin { disk_usage_percent: 10.0, fail_cookie_for: Vec::new() };
    let scaler = bookkeeper_scaler(&target, policy(), admin);

    scaler.cycle().await?;

    assert_eq!(target.patched(), Some(2), "expected a patch to 2 replicas, got {:?}", target.patched());
    Ok(())
}

#[tokio::test]
async fn a_partial_decommission_commits_only_the_retired_count() -> Result<()> {
    let replicas = (0..4)
        .map(|ordinal| Replica {
            pod: format!("test-bookkeeper-default-{}", ordinal),
            started_at: Some(Utc::now() - ChronoDuration::hours(1)),
        })
        .collect();
    let target = MockTarget::new(Some(replicas));
    // Scale down asks for two retirements; the second candidate (ordinal 2)
    // refuses to give up its cookie.
    let blocked = Bookie::new("test", "pulsar", "default", 2);
    let admin = ScriptedAdmin { disk_usage_percent: 10.0, fail_cookie_for: vec![blocked.id] };
    let scaler = bookkeeper_scaler(&target, ScalePolicy { scale_down_by: 2, ..policy() }, admin);

    scaler.cycle().await?;

    assert_eq!(target.patched(), Some(3), "expected a patch to 3 replicas, got {:?}", target.patched());
    Ok(())
}

#[tokio::test]
async fn high_disk_usage_scales_up_without_decommissioning() -> Result<()> {
    let replicas = (0..3)
        .map(|ordinal| Replica {
            pod: format!("test-bookkeeper-default-{}", ordinal),
            started_at: Some(Utc::now() - ChronoDuration::hours(1)),
        })
        .collect();
    let target = MockTarget::new(Some(replicas));
    let admin = ScriptedAdmin { disk_usage_percent: 95.0, fail_cookie_for: Vec::new() };
    let scaler = bookkeeper_scaler(&target, policy(), admin);

    scaler.cycle().await?;

    assert_eq!(target.patched(), Some(4), "expected a patch to 4 replicas, got {:?}", target.patched());
    Ok(())
}
