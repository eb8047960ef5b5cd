//! In-memory catalog of snapshots, keyed by commit time
//!
//! Transient: rebuilt from the snapshot directory on start. Readers never see
//! a partially inserted entry.

use crate::common::{Error, Result};
use crate::snapshot::record::SnapshotRecord;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Entries = BTreeMap<i64, Arc<SnapshotRecord>>;

#[derive(Clone, Default)]
pub struct SnapshotCatalog {
    entries: Arc<RwLock<Entries>>,
}

impl SnapshotCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add `record` under its commit time. A second record with the same
    /// commit time is rejected and the existing entry is kept.
    pub fn insert(&self, record: SnapshotRecord) -> Result<Arc<SnapshotRecord>> {
        let key = record.commit_time();
        let mut entries = self.write();
        if entries.contains_key(&key) {
            return Err(Error::DuplicateKey(key));
        }
        let record = Arc::new(record);
        entries.insert(key, record.clone());
        tracing::debug!(
            "Cataloged snapshot {} at {}",
            record.commit_counter(),
            key
        );
        Ok(record)
    }

    pub fn get(&self, commit_time: i64) -> Option<Arc<SnapshotRecord>> {
        self.read().get(&commit_time).cloned()
    }

    /// Record with the greatest commit time at or before `commit_time`.
    pub fn lookup_floor(&self, commit_time: i64) -> Option<Arc<SnapshotRecord>> {
        self.read()
            .range(..=commit_time)
            .next_back()
            .map(|(_, r)| r.clone())
    }

    /// Record with the smallest commit time at or after `commit_time`.
    pub fn ceiling(&self, commit_time: i64) -> Option<Arc<SnapshotRecord>> {
        self.read()
            .range(commit_time..)
            .next()
            .map(|(_, r)| r.clone())
    }

    /// Records with `from <= commit time <= to`, in key order.
    pub fn range(&self, from: i64, to: i64) -> SnapshotRange {
        SnapshotRange {
            entries: self.entries.clone(),
            from,
            to,
            cursor: None,
        }
    }

    /// Remove the record at `commit_time`, if any.
    pub fn remove(&self, commit_time: i64) -> Option<Arc<SnapshotRecord>> {
        self.write().remove(&commit_time)
    }

    pub fn first(&self) -> Option<Arc<SnapshotRecord>> {
        self.read().values().next().cloned()
    }

    pub fn last(&self) -> Option<Arc<SnapshotRecord>> {
        self.read().values().next_back().cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Every record, oldest first
    pub fn records(&self) -> Vec<Arc<SnapshotRecord>> {
        self.read().values().cloned().collect()
    }

    pub fn total_size(&self) -> u64 {
        self.read().values().map(|r| r.size_on_disk()).sum()
    }
}

impl std::fmt::Debug for SnapshotCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.read();
        f.debug_struct("SnapshotCatalog")
            .field("len", &entries.len())
            .field("first", &entries.keys().next())
            .field("last", &entries.keys().next_back())
            .finish()
    }
}

/// Lazy walk over a key range of a [`SnapshotCatalog`].
///
/// Each step takes the read lock only for that step, so the walk sees
/// inserts and removals made while it is in progress. [`restart`] rewinds it.
///
/// [`restart`]: SnapshotRange::restart
#[derive(Clone)]
pub struct SnapshotRange {
    entries: Arc<RwLock<Entries>>,
    from: i64,
    to: i64,
    cursor: Option<i64>,
}

impl SnapshotRange {
    pub fn restart(&mut self) {
        self.cursor = None;
    }
}

impl Iterator for SnapshotRange {
    type Item = Arc<SnapshotRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.from > self.to {
            return None;
        }
        let lower = match self.cursor {
            Some(cursor) if cursor >= self.to => return None,
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Included(self.from),
        };
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let (key, record) = entries
            .range((lower, Bound::Included(self.to)))
            .next()
            .map(|(k, r)| (*k, r.clone()))?;
        self.cursor = Some(key);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::record::RootBlock;

    fn record(counter: u64, commit_time: i64) -> SnapshotRecord {
        SnapshotRecord::new(RootBlock::new(counter, commit_time), 1024)
    }

    fn catalog(times: &[i64]) -> SnapshotCatalog {
        let catalog = SnapshotCatalog::new();
        for (i, t) in times.iter().enumerate() {
            catalog.insert(record(i as u64 + 1, *t)).unwrap();
        }
        catalog
    }

    fn times(range: impl Iterator<Item = Arc<SnapshotRecord>>) -> Vec<i64> {
        range.map(|r| r.commit_time()).collect()
    }

    #[test]
    fn test_floor_lookup() {
        let catalog = catalog(&[100, 200, 300]);
        assert_eq!(catalog.lookup_floor(250).unwrap().commit_time(), 200);
        assert_eq!(catalog.lookup_floor(200).unwrap().commit_time(), 200);
        assert_eq!(catalog.lookup_floor(1_000).unwrap().commit_time(), 300);
        assert!(catalog.lookup_floor(50).is_none());
    }

    #[test]
    fn test_ceiling_lookup() {
        let catalog = catalog(&[100, 200, 300]);
        assert_eq!(catalog.ceiling(150).unwrap().commit_time(), 200);
        assert_eq!(catalog.ceiling(100).unwrap().commit_time(), 100);
        assert!(catalog.ceiling(301).is_none());
    }

    #[test]
    fn test_insert_then_floor_returns_same_record() {
        let catalog = SnapshotCatalog::new();
        let inserted = catalog.insert(record(9, 900)).unwrap();
        assert!(Arc::ptr_eq(&inserted, &catalog.lookup_floor(900).unwrap()));
    }

    #[test]
    fn test_duplicate_keeps_prior_entry() {
        let catalog = SnapshotCatalog::new();
        catalog.insert(record(1, 100)).unwrap();
        let err = catalog.insert(record(2, 100)).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(100)));
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(100).unwrap().commit_counter(), 1);
    }

    #[test]
    fn test_range_inclusive_and_ordered() {
        let catalog = catalog(&[100, 200, 300]);
        assert_eq!(times(catalog.range(150, 300)), vec![200, 300]);
        assert_eq!(times(catalog.range(100, 100)), vec![100]);
        assert!(times(catalog.range(301, 400)).is_empty());
        assert!(times(catalog.range(300, 100)).is_empty());
    }

    #[test]
    fn test_range_is_restartable() {
        let catalog = catalog(&[100, 200, 300]);
        let mut range = catalog.range(0, 1_000);
        assert_eq!(range.next().unwrap().commit_time(), 100);
        assert_eq!(range.next().unwrap().commit_time(), 200);
        range.restart();
        assert_eq!(times(range), vec![100, 200, 300]);
    }

    #[test]
    fn test_range_sees_concurrent_changes() {
        let catalog = catalog(&[100, 200, 300]);
        let mut range = catalog.range(0, 1_000);
        assert_eq!(range.next().unwrap().commit_time(), 100);
        catalog.remove(200);
        catalog.insert(record(4, 250)).unwrap();
        assert_eq!(times(range), vec![250, 300]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let catalog = catalog(&[100]);
        assert!(catalog.remove(999).is_none());
        assert!(catalog.remove(100).is_some());
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_first_last_total() {
        let catalog = catalog(&[300, 100, 200]);
        assert_eq!(catalog.first().unwrap().commit_time(), 100);
        assert_eq!(catalog.last().unwrap().commit_time(), 300);
        assert_eq!(catalog.total_size(), 3 * 1024);
    }
}
