//! Snapshot catalog
//!
//! Snapshot files are written by the replicated store; this module reads
//! their headers into an ordered catalog and answers restore-point and
//! retention queries over it.

pub mod catalog;
pub mod policy;
pub mod record;
pub mod scan;

pub use catalog::{SnapshotCatalog, SnapshotRange};
pub use policy::{
    prune_candidates, retention_policy, sweep, FloorRestorePolicy, KeepNewerThan, RestorePolicy,
    RetainAll, SnapshotPolicy,
};
pub use record::{RootBlock, SnapshotRecord, RECORD_VERSION, ROOT_BLOCK_SIZE};
pub use scan::{read_snapshot, remove_snapshot, scan_dir, write_snapshot};
