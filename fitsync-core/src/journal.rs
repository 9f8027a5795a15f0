use crate::{Error, Key, Lsn, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const JOURNAL_HEADER_SIZE: usize = 16;
const JOURNAL_MAGIC: u32 = 0x46534A00; // "FSJ\0"
const JOURNAL_FORMAT_VERSION: u32 = 1;
const FRAME_HEADER_SIZE: usize = 12; // lsn(8) + len(4)
const FRAME_TRAILER_SIZE: usize = 4; // crc(4)

/// One logical write inside a committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Upsert a row; `row` is the row's JSON encoding
    Put { table: String, key: Key, row: String },
    /// Remove a row if present
    Delete { table: String, key: Key },
}

impl Op {
    pub fn table(&self) -> &str {
        match self {
            Op::Put { table, .. } | Op::Delete { table, .. } => table,
        }
    }
}

/// Result of scanning a journal on open
pub struct Recovered {
    pub schema_version: u32,
    pub frames: Vec<(Lsn, Vec<Op>)>,
    /// Bytes dropped from a torn or corrupt tail
    pub truncated_bytes: u64,
}

/// Append-only transaction journal
///
/// Format: [magic(4) | format(4) | schema_version(4) | reserved(4)] [frame...]
/// Frame:  [lsn(8) | len(4) | bincode(Vec<Op>) | crc(4)]
///
/// Each committed transaction is exactly one frame, written with a single
/// `write_all`. A frame whose bytes are incomplete or whose checksum fails is
/// the tail of an interrupted commit and is discarded on open.
///
/// Frames are always written at `end`, the offset just past the last frame
/// known to be complete. Bytes left behind by a failed append are cut off
/// before the next frame goes down.
pub struct Journal {
    file: File,
    path: PathBuf,
    end: u64,
    frames_written: usize,
}

impl Journal {
    /// Create a new journal file, failing if one exists
    pub fn create(path: impl AsRef<Path>, schema_version: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        file.write_all(&encode_header(schema_version))?;
        file.sync_all()?;

        Ok(Self {
            file,
            path,
            end: JOURNAL_HEADER_SIZE as u64,
            frames_written: 0,
        })
    }

    /// Open an existing journal and return every intact frame
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Recovered)> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;

        if data.len() < JOURNAL_HEADER_SIZE {
            return Err(Error::Corruption("journal header truncated".to_string()));
        }

        let mut header = &data[..JOURNAL_HEADER_SIZE];
        let magic = header.get_u32();
        if magic != JOURNAL_MAGIC {
            return Err(Error::Corruption("invalid journal magic".to_string()));
        }
        let format = header.get_u32_le();
        if format != JOURNAL_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported journal format {}",
                format
            )));
        }
        let schema_version = header.get_u32_le();

        let mut offset = JOURNAL_HEADER_SIZE;
        let mut frames = Vec::new();

        while data.len() - offset >= FRAME_HEADER_SIZE {
            let mut frame_header = &data[offset..offset + FRAME_HEADER_SIZE];
            let lsn = frame_header.get_u64_le();
            let len = frame_header.get_u32_le() as usize;

            let body_start = offset + FRAME_HEADER_SIZE;
            let frame_end = body_start + len + FRAME_TRAILER_SIZE;
            if frame_end > data.len() {
                break;
            }

            let body = &data[body_start..body_start + len];
            let mut trailer = &data[body_start + len..frame_end];
            let expected_crc = trailer.get_u32_le();
            if crc32fast::hash(body) != expected_crc {
                tracing::warn!(lsn, "journal frame failed checksum, discarding tail");
                break;
            }

            let ops: Vec<Op> = bincode::deserialize(body)
                .map_err(|e| Error::Corruption(format!("journal frame {}: {}", lsn, e)))?;

            frames.push((lsn, ops));
            offset = frame_end;
        }

        let truncated_bytes = (data.len() - offset) as u64;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if truncated_bytes > 0 {
            tracing::warn!(
                path = %path.display(),
                truncated_bytes,
                "truncating incomplete journal tail"
            );
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }

        let frames_written = frames.len();
        Ok((
            Self {
                file,
                path,
                end: offset as u64,
                frames_written,
            },
            Recovered {
                schema_version,
                frames,
                truncated_bytes,
            },
        ))
    }

    /// Append one committed transaction as a single frame
    pub fn append(&mut self, lsn: Lsn, ops: &[Op], sync: bool) -> Result<()> {
        let data = bincode::serialize(ops)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        let crc = crc32fast::hash(&data);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + data.len() + FRAME_TRAILER_SIZE);
        buf.put_u64_le(lsn);
        buf.put_u32_le(data.len() as u32);
        buf.put_slice(&data);
        buf.put_u32_le(crc);

        if let Err(e) = self.write_frame(&buf, sync) {
            // Cut off whatever part of the frame reached the file
            if let Err(rollback) = self.file.set_len(self.end) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial journal frame"
                );
            }
            return Err(e);
        }

        self.end += buf.len() as u64;
        self.frames_written += 1;
        Ok(())
    }

    fn write_frame(&mut self, buf: &[u8], sync: bool) -> Result<()> {
        if self.file.metadata()?.len() != self.end {
            tracing::warn!(
                path = %self.path.display(),
                end = self.end,
                "discarding bytes past the last complete journal frame"
            );
            self.file.set_len(self.end)?;
        }
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(buf)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drop every frame, keeping only a fresh header. Called after a snapshot
    /// has made the frames redundant.
    pub fn reset(&mut self, schema_version: u32) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&encode_header(schema_version))?;
        self.file.sync_all()?;
        self.end = JOURNAL_HEADER_SIZE as u64;
        self.frames_written = 0;
        Ok(())
    }

    /// Frames appended (or recovered) since the last reset
    pub fn frames_written(&self) -> usize {
        self.frames_written
    }
}

fn encode_header(schema_version: u32) -> BytesMut {
    let mut header = BytesMut::with_capacity(JOURNAL_HEADER_SIZE);
    header.put_u32(JOURNAL_MAGIC); // big-endian for magic
    header.put_u32_le(JOURNAL_FORMAT_VERSION);
    header.put_u32_le(schema_version);
    header.put_u32_le(0); // reserved
    header
}
