//! Restore and retention policies over a [`SnapshotCatalog`]

use crate::common::{Result, SnapshotConfig};
use crate::snapshot::catalog::SnapshotCatalog;
use crate::snapshot::record::SnapshotRecord;
use std::sync::Arc;
use std::time::Duration;

/// Picks the snapshot to restore from for a desired recovery point.
pub trait RestorePolicy: Send + Sync {
    fn restore_point(&self, catalog: &SnapshotCatalog, target: i64) -> Option<Arc<SnapshotRecord>>;
}

/// Closest snapshot at or before the target
#[derive(Debug, Clone, Copy, Default)]
pub struct FloorRestorePolicy;

impl RestorePolicy for FloorRestorePolicy {
    fn restore_point(&self, catalog: &SnapshotCatalog, target: i64) -> Option<Arc<SnapshotRecord>> {
        catalog.lookup_floor(target)
    }
}

/// Decides whether a snapshot is still inside the retention window.
pub trait SnapshotPolicy: Send + Sync {
    fn should_retain(&self, record: &SnapshotRecord, now: i64) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetainAll;

impl SnapshotPolicy for RetainAll {
    fn should_retain(&self, _record: &SnapshotRecord, _now: i64) -> bool {
        true
    }
}

/// Retain snapshots whose commit time is within `max_age` of now
#[derive(Debug, Clone, Copy)]
pub struct KeepNewerThan {
    pub max_age: Duration,
}

impl KeepNewerThan {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

impl SnapshotPolicy for KeepNewerThan {
    fn should_retain(&self, record: &SnapshotRecord, now: i64) -> bool {
        let max_age = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        record.commit_time() >= now.saturating_sub(max_age)
    }
}

/// Retention window from configuration: everything is kept without a
/// maximum age.
pub fn retention_policy(config: &SnapshotConfig) -> Result<Box<dyn SnapshotPolicy>> {
    Ok(match config.max_age()? {
        Some(max_age) => Box::new(KeepNewerThan::new(max_age)),
        None => Box::new(RetainAll),
    })
}

/// Records `policy` would drop, oldest first. The newest `keep_last`
/// records are never candidates.
pub fn prune_candidates(
    catalog: &SnapshotCatalog,
    policy: &dyn SnapshotPolicy,
    keep_last: usize,
    now: i64,
) -> Vec<Arc<SnapshotRecord>> {
    let records = catalog.records();
    let protected_from = records.len().saturating_sub(keep_last);
    records
        .into_iter()
        .take(protected_from)
        .filter(|r| !policy.should_retain(r, now))
        .collect()
}

/// Remove pruned records from the catalog and return them.
pub fn sweep(
    catalog: &SnapshotCatalog,
    policy: &dyn SnapshotPolicy,
    keep_last: usize,
    now: i64,
) -> Vec<Arc<SnapshotRecord>> {
    let pruned = prune_candidates(catalog, policy, keep_last, now);
    for record in &pruned {
        catalog.remove(record.commit_time());
    }
    if !pruned.is_empty() {
        tracing::info!(
            "Pruned {} snapshot(s), {} remain",
            pruned.len(),
            catalog.len()
        );
    }
    pruned
}
