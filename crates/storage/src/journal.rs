//! Append-only journal backing [`KvStore::open`](crate::KvStore::open)
//!
//! Each atomic batch is one frame:
//!
//! ```text
//! | len: u32 LE | crc32(payload): u32 LE | payload (MessagePack JournalRecord) |
//! ```
//!
//! Replay stops at the first short or corrupt frame; everything from that
//! offset on is a torn tail and is truncated before appending resumes.

use idxcoord_core::{CoordError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const FRAME_HEADER_SIZE: usize = 8;

/// Journal file name inside the store directory
pub const JOURNAL_FILE_NAME: &str = "meta.journal";

/// fsync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// fsync after every batch
    #[default]
    Always,
    /// flush to the OS only; a crash may lose the last batches
    Buffered,
}

/// One logged mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Set a key
    Put {
        /// Key
        key: String,
        /// Value
        value: Vec<u8>,
    },
    /// Remove a key
    Delete {
        /// Key
        key: String,
    },
    /// Remove every key under a prefix
    DeletePrefix {
        /// Prefix
        prefix: String,
    },
}

/// One frame's payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// Atomic batch of mutations
    Batch(Vec<JournalOp>),
    /// Full state; replaces everything before it
    Snapshot(Vec<(String, Vec<u8>)>),
}

/// Result of replaying a journal file
#[derive(Debug, Default)]
pub struct ReplayResult {
    /// Records in file order
    pub records: Vec<JournalRecord>,
    /// Bytes dropped from a torn tail
    pub truncated_bytes: u64,
}

/// Journal writer
pub struct Journal {
    path: PathBuf,
    file: File,
    sync: SyncMode,
    frames_written: u64,
}

fn io_err(path: &Path, e: std::io::Error) -> CoordError {
    CoordError::storage(format!("journal {}: {}", path.display(), e))
}

fn encode_frame(record: &JournalRecord) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(record).map_err(|e| CoordError::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode frames from a byte buffer; returns records and the end of the valid prefix
fn decode_frames(bytes: &[u8]) -> (Vec<JournalRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + FRAME_HEADER_SIZE <= bytes.len() {
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        let start = offset + FRAME_HEADER_SIZE;
        let Some(end) = start.checked_add(len) else { break };
        if end > bytes.len() {
            break;
        }
        let payload = &bytes[start..end];
        if crc32fast::hash(payload) != crc {
            break;
        }
        match rmp_serde::from_slice::<JournalRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        offset = end;
    }
    (records, offset)
}

impl Journal {
    /// Open (creating if needed) the journal in `dir` and replay it
    pub fn open(dir: &Path, sync: SyncMode) -> Result<(Self, ReplayResult)> {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let path = dir.join(JOURNAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| io_err(&path, e))?;
        let (records, valid) = decode_frames(&bytes);
        let truncated_bytes = (bytes.len() - valid) as u64;
        if truncated_bytes > 0 {
            warn!(
                target: "idxcoord::kv",
                path = %path.display(),
                truncated_bytes,
                "truncating torn journal tail"
            );
            file.set_len(valid as u64).map_err(|e| io_err(&path, e))?;
            file.seek(SeekFrom::End(0)).map_err(|e| io_err(&path, e))?;
        }
        info!(
            target: "idxcoord::kv",
            path = %path.display(),
            records = records.len(),
            "journal replayed"
        );

        Ok((
            Journal {
                path,
                file,
                sync,
                frames_written: 0,
            },
            ReplayResult {
                records,
                truncated_bytes,
            },
        ))
    }

    /// Append one record; durable according to the sync mode on success
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let frame = encode_frame(record)?;
        self.file
            .write_all(&frame)
            .map_err(|e| io_err(&self.path, e))?;
        match self.sync {
            SyncMode::Always => self.file.sync_data().map_err(|e| io_err(&self.path, e))?,
            SyncMode::Buffered => self.file.flush().map_err(|e| io_err(&self.path, e))?,
        }
        self.frames_written += 1;
        Ok(())
    }

    /// Replace the journal with a single snapshot frame
    pub fn rewrite(&mut self, snapshot: Vec<(String, Vec<u8>)>) -> Result<()> {
        let tmp = self.path.with_extension("journal.tmp");
        let frame = encode_frame(&JournalRecord::Snapshot(snapshot))?;
        {
            let mut out = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
            out.write_all(&frame).map_err(|e| io_err(&tmp, e))?;
            out.sync_all().map_err(|e| io_err(&tmp, e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))?;
        self.frames_written = 1;
        Ok(())
    }

    /// Frames appended since open or the last rewrite
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}
