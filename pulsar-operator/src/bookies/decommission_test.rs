use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::decommission::DecommissionEngine;
use super::{Bookie, BookieAdmin, BookieStats};

const RECOVERY_OK: &str = "Recover bookie operation completed with rc: OK: No problem";
const COOKIE_DELETED: &str = "Successfully deleted the cookie for bookie";

fn bookie(ordinal: u32) -> Bookie {
    Bookie::new("test", "pulsar", "default", ordinal)
}

/// Scripted `BookieAdmin` recording every call.
#[derive(Default)]
struct MockAdmin {
    /// Per-bookie scripted outputs for successive `delete_cookie` calls;
    /// exhausted scripts and unscripted bookies yield the success marker.
    cookie_outputs: Mutex<HashMap<String, Vec<String>>>,
    /// Bookies whose recovery fails outright.
    fail_recover: Vec<String>,
    /// Bookies still holding ledgers after recovery.
    remaining_ledgers: Vec<String>,
    under_replicated: bool,
    read_only: Mutex<BTreeMap<String, bool>>,
    log: Mutex<Vec<String>>,
}

impl MockAdmin {
    fn script_cookie_outputs(&self, bookie: &Bookie, outputs: &[&str]) {
        self.cookie_outputs
            .lock()
            .unwrap()
            .insert(bookie.id.clone(), outputs.iter().rev().map(|s| s.to_string()).collect());
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    fn is_read_only(&self, bookie: &Bookie) -> bool {
        *self.read_only.lock().unwrap().get(&bookie.id).unwrap_or(&false)
    }
}

#[async_trait]
impl BookieAdmin for MockAdmin {
    async fn stats(&self, _bookie: &Bookie) -> Result<BookieStats> {
        unimplemented!("not exercised by decommission")
    }

    async fn set_read_only(&self, bookie: &Bookie, read_only: bool) -> Result<()> {
        self.record(format!("read-only:{}:{}", bookie.pod, read_only));
        self.read_only.lock().unwrap().insert(bookie.id.clone(), read_only);
        Ok(())
    }

    async fn recover(&self, bookie: &Bookie) -> Result<String> {
        self.record(format!("recover:{}", bookie.pod));
        if self.fail_recover.contains(&bookie.id) {
            bail!("recovery failed for {}", bookie.id);
        }
        Ok(RECOVERY_OK.to_string())
    }

    async fn list_ledgers(&self, bookie: &Bookie) -> Result<Vec<u64>> {
        if self.remaining_ledgers.contains(&bookie.id) {
            return Ok(vec![42]);
        }
        Ok(Vec::new())
    }

    async fn has_under_replicated_ledgers(&self) -> Result<bool> {
        self.record("audit".to_string());
        Ok(self.under_replicated)
    }

    async fn delete_cookie(&self, bookie: &Bookie) -> Result<String> {
        self.record(format!("delete-cookie:{}", bookie.pod));
        let output = self
            .cookie_outputs
            .lock()
            .unwrap()
            .get_mut(&bookie.id)
            .and_then(Vec::pop)
            .unwrap_or_else(|| COOKIE_DELETED.to_string());
        Ok(output)
    }

    async fn delete_cookie_file(&self, bookie: &Bookie) -> Result<()> {
        self.record(format!("delete-cookie-file:{}", bookie.pod));
        Ok(())
    }
}

fn engine(admin: MockAdmin) -> DecommissionEngine<MockAdmin> {
    DecommissionEngine::with_settle_delay(admin, Duration::from_millis(0))
}

#[tokio::test]
async fn full_retirement_of_two_bookies() -> Result<()> {
    let engine = engine(MockAdmin::default());
    let candidates = [bookie(2), bookie(1)];

    let retired = engine.retire(&candidates).await;

    assert_eq!(retired, 2, "expected both bookies retired, got {}", retired);
    // Retired bookies are never flipped back to writable: their ledgers are
    // relocated and their cookies gone, so they stay read-only until the
    // replica count change removes the pod.
    assert!(engine.admin().is_read_only(&candidates[0]), "retired bookie must stay read-only");
    assert!(engine.admin().is_read_only(&candidates[1]), "retired bookie must stay read-only");
    let log = engine.admin().take_log();
    let expected = vec![
        "read-only:test-bookkeeper-default-2:true",
        "read-only:test-bookkeeper-default-1:true",
        "recover:test-bookkeeper-default-2",
        "recover:test-bookkeeper-default-1",
        "audit",
        "delete-cookie:test-bookkeeper-default-2",
        "delete-cookie-file:test-bookkeeper-default-2",
        "delete-cookie:test-bookkeeper-default-1",
        "delete-cookie-file:test-bookkeeper-default-1",
    ];
    assert_eq!(log, expected, "unexpected call sequence: {:?}", log);
    Ok(())
}

#[tokio::test]
async fn failed_cookie_deletion_rolls_back_the_remaining_candidate() -> Result<()> {
    let admin = MockAdmin::default();
    let candidates = [bookie(2), bookie(1)];
    // Every attempt at the second bookie's cookie yields garbage.
    admin.script_cookie_outputs(&candidates[1], &["zk error", "zk error", "zk error"]);
    let engine = engine(admin);

    let retired = engine.retire(&candidates).await;

    assert_eq!(retired, 1, "expected only the first bookie retired, got {}", retired);
    assert!(engine.admin().is_read_only(&candidates[0]), "retired bookie must stay read-only");
    assert!(
        !engine.admin().is_read_only(&candidates[1]),
        "failed candidate must be restored to writable"
    );
    let log = engine.admin().take_log();
    let deletions = log.iter().filter(|entry| *entry == "delete-cookie:test-bookkeeper-default-1").count();
    assert_eq!(deletions, 3, "expected 3 deletion attempts, got {}", deletions);
    assert!(
        log.contains(&"read-only:test-bookkeeper-default-1:false".to_string()),
        "missing rollback call in {:?}",
        log
    );
    Ok(())
}

#[tokio::test]
async fn cookie_already_absent_counts_as_success() -> Result<()> {
    let admin = MockAdmin::default();
    let candidates = [bookie(1)];
    admin.script_cookie_outputs(&candidates[0], &["zk error", "No cookie to remove for bookie"]);
    let engine = engine(admin);

    let retired = engine.retire(&candidates).await;

    assert_eq!(retired, 1, "expected retirement to succeed on retry, got {}", retired);
    Ok(())
}

#[tokio::test]
async fn recovery_failure_aborts_remaining_candidates() -> Result<()> {
    let candidates = [bookie(2), bookie(1)];
    let admin = MockAdmin { fail_recover: vec![candidates[0].id.clone()], ..Default::default() };
    let engine = engine(admin);

    let retired = engine.retire(&candidates).await;

    assert_eq!(retired, 0, "expected no retirements, got {}", retired);
    let log = engine.admin().take_log();
    assert!(!log.contains(&"recover:test-bookkeeper-default-1".to_string()), "second recovery must not run");
    assert!(!log.contains(&"audit".to_string()), "audit must not run after a failed recovery");
    assert!(!engine.admin().is_read_only(&candidates[0]), "candidates must be rolled back");
    assert!(!engine.admin().is_read_only(&candidates[1]), "candidates must be rolled back");
    Ok(())
}

#[tokio::test]
async fn remaining_ledgers_block_cookie_deletion() -> Result<()> {
    let candidates = [bookie(1)];
    let admin = MockAdmin { remaining_ledgers: vec![candidates[0].id.clone()], ..Default::default() };
    let engine = engine(admin);

    let retired = engine.retire(&candidates).await;

    assert_eq!(retired, 0, "expected no retirements, got {}", retired);
    let log = engine.admin().take_log();
    assert!(!log.iter().any(|entry| entry.starts_with("delete-cookie")), "cookie must survive: {:?}", log);
    Ok(())
}

#[tokio::test]
async fn under_replicated_audit_blocks_cookie_deletion() -> Result<()> {
    let admin = MockAdmin { under_replicated: true, ..Default::default() };
    let engine = engine(admin);
    let candidates = [bookie(2), bookie(1)];

    let retired = engine.retire(&candidates).await;

    assert_eq!(retired, 0, "expected no retirements, got {}", retired);
    let log = engine.admin().take_log();
    assert!(!log.iter().any(|entry| entry.starts_with("delete-cookie")), "cookie must survive: {:?}", log);
    assert!(!engine.admin().is_read_only(&candidates[0]), "candidates must be rolled back");
    Ok(())
}
