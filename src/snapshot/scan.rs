//! Snapshot directory I/O
//!
//! One file per snapshot, named `<commit counter, 21 digits>.snap`, starting
//! with the encoded [`SnapshotRecord`].

use crate::common::{Error, Result};
use crate::snapshot::catalog::SnapshotCatalog;
use crate::snapshot::record::SnapshotRecord;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_EXTENSION: &str = "snap";
const COUNTER_DIGITS: usize = 21;

/// Commit counter encoded in a snapshot file name, if it is one.
pub fn parse_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".snap")?;
    if stem.len() != COUNTER_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

pub fn snapshot_path(dir: &Path, record: &SnapshotRecord) -> PathBuf {
    dir.join(record.file_name())
}

/// Write `record`'s header file into `dir`. Written to a temporary file and
/// renamed so a scan never sees a partial header.
pub fn write_snapshot(dir: &Path, record: &SnapshotRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = snapshot_path(dir, record);
    let tmp = path.with_extension("snap.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        record.write_to(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}

pub fn read_snapshot(path: &Path) -> Result<SnapshotRecord> {
    let mut reader = BufReader::new(File::open(path)?);
    SnapshotRecord::read_from(&mut reader)
}

/// Delete `record`'s file. A missing file is not an error.
pub fn remove_snapshot(dir: &Path, record: &SnapshotRecord) -> Result<()> {
    match fs::remove_file(snapshot_path(dir, record)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Rebuild a catalog from `dir`.
///
/// Files not named like snapshots are ignored. Headers with a bad checksum
/// or a counter that disagrees with the file name are skipped with a
/// warning. An unknown format version aborts the scan.
pub fn scan_dir(dir: &Path) -> Result<SnapshotCatalog> {
    let catalog = SnapshotCatalog::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Snapshot directory {} does not exist", dir.display());
            return Ok(catalog);
        }
        Err(e) => return Err(e.into()),
    };

    let mut skipped = 0usize;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(counter) = file_name.to_str().and_then(parse_file_name) else {
            continue;
        };
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        let record = match read_snapshot(&path) {
            Ok(record) => record,
            Err(e @ Error::UnsupportedVersion(_)) => return Err(e),
            Err(e @ (Error::ChecksumMismatch { .. } | Error::Corrupted(_))) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        if record.commit_counter() != counter {
            tracing::warn!(
                "Skipping {}: header counter {} does not match file name",
                path.display(),
                record.commit_counter()
            );
            skipped += 1;
            continue;
        }
        catalog.insert(record)?;
    }

    tracing::info!(
        "Loaded {} snapshot(s) from {} ({} skipped)",
        catalog.len(),
        dir.display(),
        skipped
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::record::RootBlock;
    use tempfile::TempDir;

    fn record(counter: u64, commit_time: i64) -> SnapshotRecord {
        SnapshotRecord::new(RootBlock::new(counter, commit_time), counter * 100)
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("000000000000000000042.snap"), Some(42));
        assert_eq!(parse_file_name("42.snap"), None);
        assert_eq!(parse_file_name("000000000000000000042.snap.tmp"), None);
        assert_eq!(parse_file_name("00000000000000000004x.snap"), None);
    }

    #[test]
    fn test_scan_rebuilds_catalog() {
        let dir = TempDir::new().unwrap();
        for (counter, time) in [(1, 100), (2, 200), (3, 300)] {
            write_snapshot(dir.path(), &record(counter, time)).unwrap();
        }
        fs::write(dir.path().join("README"), b"not a snapshot").unwrap();

        let catalog = scan_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.lookup_floor(250).unwrap().commit_counter(), 2);
    }

    #[test]
    fn test_scan_skips_corrupt_header() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), &record(1, 100)).unwrap();
        let bad = write_snapshot(dir.path(), &record(2, 200)).unwrap();
        let mut bytes = fs::read(&bad).unwrap();
        bytes[12] ^= 0xff;
        fs::write(&bad, bytes).unwrap();

        let catalog = scan_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_scan_fails_on_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = write_snapshot(dir.path(), &record(1, 100)).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[0..4].copy_from_slice(&2u32.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            scan_dir(dir.path()),
            Err(Error::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let catalog = scan_dir(&dir.path().join("absent")).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_remove_snapshot() {
        let dir = TempDir::new().unwrap();
        let record = record(1, 100);
        let path = write_snapshot(dir.path(), &record).unwrap();
        remove_snapshot(dir.path(), &record).unwrap();
        assert!(!path.exists());
        remove_snapshot(dir.path(), &record).unwrap();
    }
}
