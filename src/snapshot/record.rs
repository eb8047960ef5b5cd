//! Snapshot record and its on-disk encoding
//!
//! Layout, little-endian:
//! `[VERSION:4][ROOT BLOCK:64][SIZE_ON_DISK:8]`
//!
//! Root block:
//! `[COMMIT_COUNTER:8][LAST_COMMIT_TIME:8][PAYLOAD:44][CRC32:4]`
//! where the CRC covers the first 60 bytes.

use crate::common::{crc32, Error, Result};
use std::io::{Read, Write};

pub const RECORD_VERSION: u32 = 1;
pub const ROOT_BLOCK_SIZE: usize = 64;
pub const ROOT_PAYLOAD_SIZE: usize = 44;
pub const ENCODED_RECORD_SIZE: usize = 4 + ROOT_BLOCK_SIZE + 8;

const CHECKSUMMED: usize = ROOT_BLOCK_SIZE - 4;

/// Fixed-size root block of a snapshot image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootBlock {
    commit_counter: u64,
    last_commit_time: i64,
    payload: [u8; ROOT_PAYLOAD_SIZE],
}

impl RootBlock {
    pub fn new(commit_counter: u64, last_commit_time: i64) -> Self {
        Self {
            commit_counter,
            last_commit_time,
            payload: [0; ROOT_PAYLOAD_SIZE],
        }
    }

    /// Attach store-specific root data. Longer input is rejected.
    pub fn with_payload(mut self, payload: &[u8]) -> Result<Self> {
        if payload.len() > ROOT_PAYLOAD_SIZE {
            return Err(Error::Corrupted(format!(
                "root payload of {} bytes exceeds {}",
                payload.len(),
                ROOT_PAYLOAD_SIZE
            )));
        }
        self.payload = [0; ROOT_PAYLOAD_SIZE];
        self.payload[..payload.len()].copy_from_slice(payload);
        Ok(self)
    }

    pub fn commit_counter(&self) -> u64 {
        self.commit_counter
    }

    pub fn last_commit_time(&self) -> i64 {
        self.last_commit_time
    }

    pub fn payload(&self) -> &[u8; ROOT_PAYLOAD_SIZE] {
        &self.payload
    }

    pub fn encode(&self) -> [u8; ROOT_BLOCK_SIZE] {
        let mut buf = [0u8; ROOT_BLOCK_SIZE];
        buf[0..8].copy_from_slice(&self.commit_counter.to_le_bytes());
        buf[8..16].copy_from_slice(&self.last_commit_time.to_le_bytes());
        buf[16..CHECKSUMMED].copy_from_slice(&self.payload);
        let checksum = crc32(&buf[..CHECKSUMMED]);
        buf[CHECKSUMMED..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; ROOT_BLOCK_SIZE]) -> Result<Self> {
        let expected = u32::from_le_bytes(le_array(&buf[CHECKSUMMED..]));
        let actual = crc32(&buf[..CHECKSUMMED]);
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                expected: format!("{:08x}", expected),
                actual: format!("{:08x}", actual),
            });
        }

        let mut payload = [0u8; ROOT_PAYLOAD_SIZE];
        payload.copy_from_slice(&buf[16..CHECKSUMMED]);
        Ok(Self {
            commit_counter: u64::from_le_bytes(le_array(&buf[0..8])),
            last_commit_time: i64::from_le_bytes(le_array(&buf[8..16])),
            payload,
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Immutable description of one point-in-time recovery image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    root: RootBlock,
    size_on_disk: u64,
}

impl SnapshotRecord {
    pub fn new(root: RootBlock, size_on_disk: u64) -> Self {
        Self { root, size_on_disk }
    }

    pub fn commit_counter(&self) -> u64 {
        self.root.commit_counter
    }

    /// Catalog key, milliseconds since the epoch
    pub fn commit_time(&self) -> i64 {
        self.root.last_commit_time
    }

    pub fn root_block(&self) -> &RootBlock {
        &self.root
    }

    pub fn size_on_disk(&self) -> u64 {
        self.size_on_disk
    }

    /// `<commit counter, 21 digits>.snap`
    pub fn file_name(&self) -> String {
        format!("{:021}.snap", self.root.commit_counter)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCODED_RECORD_SIZE);
        buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.root.encode());
        buf.extend_from_slice(&self.size_on_disk.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Corrupted(format!(
                "snapshot header truncated at {} bytes",
                buf.len()
            )));
        }
        let version = u32::from_le_bytes(le_array(&buf[0..4]));
        if version != RECORD_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        if buf.len() < ENCODED_RECORD_SIZE {
            return Err(Error::Corrupted(format!(
                "snapshot header truncated at {} of {} bytes",
                buf.len(),
                ENCODED_RECORD_SIZE
            )));
        }

        let mut root = [0u8; ROOT_BLOCK_SIZE];
        root.copy_from_slice(&buf[4..4 + ROOT_BLOCK_SIZE]);
        let root = RootBlock::decode(&root)?;
        let size_on_disk = u64::from_le_bytes(le_array(&buf[4 + ROOT_BLOCK_SIZE..]));
        Ok(Self { root, size_on_disk })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Read one record header. The version is checked before the rest of
    /// the header is read.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; ENCODED_RECORD_SIZE];
        read_header(reader, &mut buf[..4])?;
        let version = u32::from_le_bytes(le_array(&buf[0..4]));
        if version != RECORD_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        read_header(reader, &mut buf[4..])?;
        Self::decode(&buf)
    }
}

fn read_header<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::Corrupted("snapshot header truncated".into()))
        }
        Err(e) => Err(e.into()),
    }
}
