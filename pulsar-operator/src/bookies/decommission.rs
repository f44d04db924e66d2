//! Safe multi-phase retirement of bookie storage nodes.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use super::{Bookie, BookieAdmin};

/// How long to wait after marking candidates read-only before relocating
/// their data, so the state change propagates to all writers.
const SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Attempts allotted to each bookie's cookie deletion.
const COOKIE_DELETE_ATTEMPTS: usize = 3;

/// Substrings of the shell's recovery output that indicate success. Treated
/// as a stable protocol with the BookKeeper shell.
const RECOVERY_OK_MARKER: &str = "Recover bookie operation completed with rc: OK";
/// Cookie deletion counts as successful both when the cookie was removed and
/// when there was no cookie left to remove.
const COOKIE_DELETED_MARKER: &str = "Successfully deleted the cookie";
const COOKIE_ABSENT_MARKER: &str = "No cookie to remove";

/// Executor of the bookie retirement sequence.
///
/// Retirement is conservative by construction: every check that could reveal
/// data at risk happens before the irreversible cookie deletion, and any
/// candidate that does not make it all the way through is reverted to
/// writable at the end. The return value of [`retire`](Self::retire) is the
/// authoritative count of bookies actually removed; callers must scale by
/// that number, not by the requested one.
pub struct DecommissionEngine<A> {
    admin: A,
    settle_delay: Duration,
}

impl<A: BookieAdmin> DecommissionEngine<A> {
    /// Create a new instance.
    pub fn new(admin: A) -> Self {
        Self { admin, settle_delay: SETTLE_DELAY }
    }

    /// The underlying administrative client.
    pub fn admin(&self) -> &A {
        &self.admin
    }

    #[cfg(test)]
    pub fn with_settle_delay(admin: A, settle_delay: Duration) -> Self {
        Self { admin, settle_delay }
    }

    /// Retire the given candidates, in order. Returns how many of them fully
    /// completed retirement, which may be fewer than requested.
    pub async fn retire(&self, candidates: &[Bookie]) -> usize {
        // Phase 1: stop writes to every candidate. Best effort, tracked for
        // rollback.
        let mut rollback: Vec<&Bookie> = Vec::new();
        for bookie in candidates {
            match self.admin.set_read_only(bookie, true).await {
                Ok(()) => rollback.push(bookie),
                Err(err) => tracing::warn!(error = ?err, bookie = %bookie.id, "error marking bookie read-only"),
            }
        }
        tokio::time::sleep(self.settle_delay).await;

        // Phase 2: relocate each candidate's data and verify nothing remains
        // assigned to it. The first failure aborts the remaining candidates.
        let mut all_recovered = rollback.len() == candidates.len();
        if all_recovered {
            for bookie in candidates {
                if let Err(err) = self.recover_and_verify(bookie).await {
                    tracing::warn!(error = ?err, bookie = %bookie.id, "bookie recovery failed, aborting decommission");
                    all_recovered = false;
                    break;
                }
            }
        }

        // Phase 3: only once every candidate is verified empty and the
        // cluster audit is clean, delete cookies. This is the irreversible
        // step.
        let mut retired = 0;
        if all_recovered && self.audit_is_clean().await {
            for bookie in candidates {
                match self.retire_cookie(bookie).await {
                    Ok(()) => {
                        retired += 1;
                        rollback.retain(|candidate| *candidate != bookie);
                        tracing::info!(bookie = %bookie.id, "bookie decommissioned");
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, bookie = %bookie.id, "cookie deletion failed, aborting decommission");
                        break;
                    }
                }
            }
        }

        // Rollback: anything still marked read-only did not complete
        // retirement and goes back into service.
        for bookie in rollback {
            if let Err(err) = self.admin.set_read_only(bookie, false).await {
                tracing::error!(error = ?err, bookie = %bookie.id, "error restoring bookie to writable");
            }
        }

        if retired < candidates.len() {
            if retired > 0 {
                tracing::warn!(requested = candidates.len(), retired, "bookie decommission partially succeeded");
            } else {
                tracing::warn!(requested = candidates.len(), "bookie decommission failed");
            }
        }
        retired
    }

    /// Whether the cluster-wide audit reports no under-replicated ledgers.
    /// An audit that cannot be read counts as dirty.
    async fn audit_is_clean(&self) -> bool {
        match self.admin.has_under_replicated_ledgers().await {
            Ok(under_replicated) => {
                if under_replicated {
                    tracing::warn!("under-replicated ledgers present, aborting decommission");
                }
                !under_replicated
            }
            Err(err) => {
                tracing::warn!(error = ?err, "error auditing under-replicated ledgers, aborting decommission");
                false
            }
        }
    }

    async fn recover_and_verify(&self, bookie: &Bookie) -> Result<()> {
        let output = self.admin.recover(bookie).await?;
        if !output.contains(RECOVERY_OK_MARKER) {
            bail!("unexpected recovery result for bookie {}: {}", bookie.id, output.trim());
        }
        let ledgers = self.admin.list_ledgers(bookie).await?;
        if !ledgers.is_empty() {
            bail!("{} ledgers still assigned to bookie {}", ledgers.len(), bookie.id);
        }
        Ok(())
    }

    /// Delete the bookie's cookie from metadata and its on-disk artifact,
    /// retrying the metadata deletion a few times without backoff.
    async fn retire_cookie(&self, bookie: &Bookie) -> Result<()> {
        let mut last_err = anyhow!("cookie deletion failed for bookie {}", bookie.id);
        for attempt in 1..=COOKIE_DELETE_ATTEMPTS {
            match self.admin.delete_cookie(bookie).await {
                Ok(output) if output.contains(COOKIE_DELETED_MARKER) || output.contains(COOKIE_ABSENT_MARKER) => {
                    return self.admin.delete_cookie_file(bookie).await;
                }
                Ok(output) => {
                    last_err = anyhow!("unexpected cookie deletion result for bookie {}: {}", bookie.id, output.trim());
                }
                Err(err) => last_err = err,
            }
            tracing::debug!(bookie = %bookie.id, attempt, "retrying cookie deletion");
        }
        Err(last_err)
    }
}
