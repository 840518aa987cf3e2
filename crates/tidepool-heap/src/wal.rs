//! Redo log for heap transactions.
//!
//! The log is a companion file of CRC-protected records:
//! `type(u8) | target_off(u64) | payload_len(u32) | payload | crc32`.
//! A transaction is the run of records up to and including a `commit`
//! record. Replay applies committed runs in order and discards an
//! unterminated tail, a CRC mismatch, or anything after one.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tidepool_error::{Result, StoreError};
use tracing::{debug, warn};

/// Record kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalEntryKind {
    /// Replace the 8-byte word at `target_off` with the payload.
    Set,
    /// Set `nbits` bits starting at `start_bit` in the word at `target_off`.
    SetBits,
    /// Clear `nbits` bits starting at `start_bit` in the word at `target_off`.
    ClrBits,
    /// Flush `[target_off, target_off + len)` to stable storage.
    Persist,
    /// Transaction boundary; `target_off` carries the transaction sequence.
    Commit,
}

impl WalEntryKind {
    fn to_raw(self) -> u8 {
        match self {
            WalEntryKind::Set => 1,
            WalEntryKind::SetBits => 2,
            WalEntryKind::ClrBits => 3,
            WalEntryKind::Persist => 4,
            WalEntryKind::Commit => 5,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => WalEntryKind::Set,
            2 => WalEntryKind::SetBits,
            3 => WalEntryKind::ClrBits,
            4 => WalEntryKind::Persist,
            5 => WalEntryKind::Commit,
            _ => return None,
        })
    }
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub kind: WalEntryKind,
    pub target_off: u64,
    pub payload: Vec<u8>,
}

impl WalEntry {
    #[must_use]
    pub fn set_word(target_off: u64, word: [u8; 8]) -> Self {
        WalEntry {
            kind: WalEntryKind::Set,
            target_off,
            payload: word.to_vec(),
        }
    }

    #[must_use]
    pub fn bits(target_off: u64, start_bit: u32, nbits: u32, set: bool) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&start_bit.to_le_bytes());
        payload.extend_from_slice(&nbits.to_le_bytes());
        WalEntry {
            kind: if set {
                WalEntryKind::SetBits
            } else {
                WalEntryKind::ClrBits
            },
            target_off,
            payload,
        }
    }

    #[must_use]
    pub fn persist(target_off: u64, len: u64) -> Self {
        WalEntry {
            kind: WalEntryKind::Persist,
            target_off,
            payload: len.to_le_bytes().to_vec(),
        }
    }

    /// Decode a bit-range payload.
    pub fn bit_range(&self) -> Result<(u32, u32)> {
        if self.payload.len() != 8 {
            return Err(StoreError::corrupt("bit-range entry with bad payload"));
        }
        let start = u32::from_le_bytes(self.payload[0..4].try_into().expect("4-byte slice"));
        let nbits = u32::from_le_bytes(self.payload[4..8].try_into().expect("4-byte slice"));
        Ok((start, nbits))
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.push(self.kind.to_raw());
        buf.extend_from_slice(&self.target_off.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
    }
}

const ENTRY_FIXED: usize = 1 + 8 + 4;
const CRC_LEN: usize = 4;

/// The write-ahead log file.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Next transaction sequence number.
    next_seq: u64,
}

impl Wal {
    /// Open (creating if absent) the log at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Wal {
            file,
            path: path.to_path_buf(),
            next_seq: 1,
        })
    }

    /// Append one transaction: every entry followed by the commit record,
    /// then fsync. Returns the transaction sequence used.
    pub fn append_tx(&mut self, entries: &[WalEntry]) -> Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut buf = Vec::with_capacity(entries.len() * 32 + 32);
        for entry in entries {
            entry.encode_into(&mut buf);
        }
        WalEntry {
            kind: WalEntryKind::Commit,
            target_off: seq,
            payload: Vec::new(),
        }
        .encode_into(&mut buf);

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        debug!(seq, entries = entries.len(), "committed redo transaction");
        Ok(seq)
    }

    /// Read back every committed transaction in order. An unterminated or
    /// corrupt tail is discarded with a warning; everything before it is
    /// returned.
    pub fn read_committed(&mut self) -> Result<Vec<Vec<WalEntry>>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        self.file.read_to_end(&mut raw)?;

        let mut committed: Vec<Vec<WalEntry>> = Vec::new();
        let mut pending: Vec<WalEntry> = Vec::new();
        let mut pos = 0usize;
        let mut last_seq = 0u64;

        while pos + ENTRY_FIXED + CRC_LEN <= raw.len() {
            let kind = match WalEntryKind::from_raw(raw[pos]) {
                Some(kind) => kind,
                None => {
                    warn!(pos, "unknown record type in redo log tail, discarding");
                    break;
                }
            };
            let target_off =
                u64::from_le_bytes(raw[pos + 1..pos + 9].try_into().expect("8-byte slice"));
            let payload_len =
                u32::from_le_bytes(raw[pos + 9..pos + 13].try_into().expect("4-byte slice"))
                    as usize;
            let total = ENTRY_FIXED + payload_len + CRC_LEN;
            if pos + total > raw.len() {
                warn!(pos, "truncated record in redo log tail, discarding");
                break;
            }
            let body = &raw[pos..pos + ENTRY_FIXED + payload_len];
            let stored_crc = u32::from_le_bytes(
                raw[pos + ENTRY_FIXED + payload_len..pos + total]
                    .try_into()
                    .expect("4-byte slice"),
            );
            if crc32fast::hash(body) != stored_crc {
                warn!(pos, "crc mismatch in redo log tail, discarding");
                break;
            }

            if kind == WalEntryKind::Commit {
                last_seq = last_seq.max(target_off);
                committed.push(std::mem::take(&mut pending));
            } else {
                pending.push(WalEntry {
                    kind,
                    target_off,
                    payload: raw[pos + ENTRY_FIXED..pos + ENTRY_FIXED + payload_len].to_vec(),
                });
            }
            pos += total;
        }

        if !pending.is_empty() {
            debug!(
                dropped = pending.len(),
                "redo log ends without a commit record; tail discarded"
            );
        }
        self.next_seq = last_seq + 1;
        Ok(committed)
    }

    /// Discard the log after its transactions were applied and flushed.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Size of the log in bytes, for tests and monitoring.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// `true` when no record has been written since the last reset.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
