use crate::{Error, Key, Lsn, Result, SeqNo};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

const SNAPSHOT_MAGIC: u32 = 0x46535300; // "FSS\0"
const SNAPSHOT_HEADER_SIZE: usize = 8; // magic(4) + crc(4)

/// Full image of the store at one journal position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    /// Last lsn folded into this image; journal frames at or below it are stale
    pub lsn: Lsn,
    pub next_seq: SeqNo,
    pub tables: Vec<TableImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableImage {
    pub name: String,
    pub next_auto: u64,
    pub rows: Vec<RowImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowImage {
    pub key: Key,
    pub seq: SeqNo,
    pub row: String,
}

impl Snapshot {
    /// Write the snapshot next to `path` and atomically move it into place
    pub fn write(&self, path: &Path) -> Result<()> {
        let data = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE + data.len());
        buf.put_u32(SNAPSHOT_MAGIC);
        buf.put_u32_le(crc32fast::hash(&data));
        buf.put_slice(&data);

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        // Persist the rename itself; not every platform lets a directory be opened
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    /// Read a snapshot, returning None when no snapshot has been written yet
    pub fn read(path: &Path) -> Result<Option<Snapshot>> {
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(path)?;
        if data.len() < SNAPSHOT_HEADER_SIZE {
            return Err(Error::Corruption("snapshot header truncated".to_string()));
        }

        let mut header = &data[..SNAPSHOT_HEADER_SIZE];
        if header.get_u32() != SNAPSHOT_MAGIC {
            return Err(Error::Corruption("invalid snapshot magic".to_string()));
        }
        let expected_crc = header.get_u32_le();

        let body = &data[SNAPSHOT_HEADER_SIZE..];
        if crc32fast::hash(body) != expected_crc {
            return Err(Error::ChecksumMismatch);
        }

        let snapshot: Snapshot = bincode::deserialize(body)
            .map_err(|e| Error::Corruption(format!("snapshot: {}", e)))?;
        Ok(Some(snapshot))
    }
}
