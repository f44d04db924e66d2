use anyhow::Result;

use super::{parse_ledger_ids, Bookie, BookieStats, DiskUsage};

#[test]
fn bookie_id_matches_the_advertised_address() -> Result<()> {
    let bookie = Bookie::new("test", "pulsar", "bk1", 2);
    assert_eq!(bookie.pod, "test-bookkeeper-bk1-2", "unexpected pod name {}", bookie.pod);
    assert_eq!(
        bookie.id, "test-bookkeeper-bk1-2.test-bookkeeper.pulsar:3181",
        "unexpected bookie ID {}",
        bookie.id
    );
    Ok(())
}

#[test]
fn ledger_ids_are_extracted_from_shell_noise() -> Result<()> {
    let output = "\
JMX enabled by default
ledgerID: 14
some INFO log line
ledgerID: 9000
ledgerID: not-a-number
";
    let ids = parse_ledger_ids(output);
    assert_eq!(ids, vec![14, 9000], "unexpected ledger IDs {:?}", ids);
    Ok(())
}

#[test]
fn disk_usage_percent_takes_the_fullest_disk() -> Result<()> {
    let stats = BookieStats {
        writable: true,
        disks: vec![
            DiskUsage { used_bytes: 10, max_bytes: 100 },
            DiskUsage { used_bytes: 90, max_bytes: 100 },
            DiskUsage { used_bytes: 0, max_bytes: 0 },
        ],
    };
    let percent = stats.disk_usage_percent();
    assert!((percent - 90.0).abs() < f64::EPSILON, "expected 90%, got {}", percent);
    Ok(())
}
