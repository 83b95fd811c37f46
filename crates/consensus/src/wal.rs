//! Write-ahead log.
//!
//! Every input the driver processes is framed and appended here before it
//! is dispatched, which makes the state machine replayable after a crash
//! and is the barrier that prevents double-signing: a self-authored vote or
//! proposal must be durably logged before its signature leaves the signer.
//!
//! ## Record format
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Magic (4)  │ Version (1) │ Record type (1) │ Length (4, LE)   │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Payload (length bytes, JSON)                                  │
//! ├───────────────────────────────────────────────────────────────┤
//! │ CRC32 over header + payload (4, LE)                           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `EndHeight` record marks that a height is fully committed and
//! persisted in the block store; replay starts after the last one.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::round_state::RoundStateEvent;
use crate::timeout::TimeoutInfo;
use crate::types::MsgInfo;

/// Magic bytes identifying a Kestrel WAL file
const WAL_MAGIC: [u8; 4] = *b"KSWL";

/// Current WAL format version
const WAL_VERSION: u8 = 1;

/// Header size in bytes (magic + version + record type + length)
const HEADER_SIZE: usize = 10;

/// CRC32 checksum size
const CRC_SIZE: usize = 4;

/// Largest accepted payload; anything bigger is treated as corruption.
const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Errors from WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O failure
    #[error("wal i/o error: {0}")]
    Io(#[from] io::Error),

    /// A record failed to decode (bad magic, truncation, CRC mismatch)
    #[error("corrupted wal record at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset of the bad record
        offset: u64,
        /// What went wrong
        message: String,
    },

    /// Unsupported format version
    #[error("unsupported wal version {0} (expected {WAL_VERSION})")]
    UnsupportedVersion(u8),

    /// Serialization failure
    #[error("wal serialization error: {0}")]
    Serialization(String),

    /// The WAL has been closed
    #[error("wal is closed")]
    Closed,
}

/// Result type for WAL operations.
pub type WalResult<T> = std::result::Result<T, WalError>;

impl WalError {
    /// Whether this error means the log data itself is damaged (as opposed
    /// to an I/O problem). Damage triggers the one-shot repair path.
    pub fn is_data_corruption(&self) -> bool {
        matches!(
            self,
            WalError::Corrupted { .. } | WalError::UnsupportedVersion(_) | WalError::Serialization(_)
        )
    }
}

/// One record in the WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalMessage {
    /// An input message (proposal, block part, vote)
    MsgInfo(MsgInfo),
    /// A delivered timeout
    Timeout(TimeoutInfo),
    /// Height fully committed and persisted
    EndHeight(u64),
    /// Round-state snapshot taken on a step change
    RoundState(RoundStateEvent),
}

impl WalMessage {
    fn record_type(&self) -> u8 {
        match self {
            WalMessage::MsgInfo(_) => 1,
            WalMessage::Timeout(_) => 2,
            WalMessage::EndHeight(_) => 3,
            WalMessage::RoundState(_) => 4,
        }
    }
}

fn encode_record(msg: &WalMessage) -> WalResult<Vec<u8>> {
    let payload = serde_json::to_vec(msg).map_err(|e| WalError::Serialization(e.to_string()))?;
    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&WAL_MAGIC);
    data.push(WAL_VERSION);
    data.push(msg.record_type());
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&payload);
    let crc = crc32_checksum(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// The append half of the WAL.
pub struct Wal {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl Wal {
    /// Open (or create) the WAL at `path` for appending.
    pub fn open(path: &Path) -> WalResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "opened consensus wal");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(BufWriter::new(file)),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record with buffered write.
    pub fn append(&mut self, msg: &WalMessage) -> WalResult<()> {
        let data = encode_record(msg)?;
        let file = self.file.as_mut().ok_or(WalError::Closed)?;
        file.write_all(&data)?;
        Ok(())
    }

    /// Append a record and fsync it.
    pub fn append_sync(&mut self, msg: &WalMessage) -> WalResult<()> {
        self.append(msg)?;
        self.flush_sync()
    }

    /// Flush buffered records and fsync the file.
    pub fn flush_sync(&mut self) -> WalResult<()> {
        let file = self.file.as_mut().ok_or(WalError::Closed)?;
        file.flush()?;
        file.get_ref().sync_data()?;
        Ok(())
    }

    /// Flush, fsync and close. Further appends fail with [`WalError::Closed`].
    pub fn close(&mut self) -> WalResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error closing wal");
        }
    }
}

/// Sequential reader over a WAL file.
pub struct WalReader {
    reader: BufReader<File>,
    offset: u64,
}

impl WalReader {
    /// Open `path` for decoding from the start.
    pub fn open(path: &Path) -> WalResult<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// Decode the next record.
    ///
    /// Returns `Ok(None)` at a clean end of file, and
    /// [`WalError::Corrupted`] for a truncated or damaged record.
    pub fn next(&mut self) -> WalResult<Option<WalMessage>> {
        let mut header = [0u8; HEADER_SIZE];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WalError::Io(e)),
        }

        if header[0..4] != WAL_MAGIC {
            return Err(WalError::Corrupted {
                offset: self.offset,
                message: "bad magic".to_string(),
            });
        }
        let version = header[4];
        if version != WAL_VERSION {
            return Err(WalError::UnsupportedVersion(version));
        }
        let record_type = header[5];
        let payload_len =
            u32::from_le_bytes(header[6..10].try_into().expect("4 bytes")) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WalError::Corrupted {
                offset: self.offset,
                message: format!("payload length {payload_len} exceeds maximum"),
            });
        }

        let mut rest = vec![0u8; payload_len + CRC_SIZE];
        if let Err(e) = self.reader.read_exact(&mut rest) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(WalError::Corrupted {
                    offset: self.offset,
                    message: "truncated record".to_string(),
                });
            }
            return Err(WalError::Io(e));
        }

        let stored_crc = u32::from_le_bytes(
            rest[payload_len..].try_into().expect("4 bytes"),
        );
        let mut framed = Vec::with_capacity(HEADER_SIZE + payload_len);
        framed.extend_from_slice(&header);
        framed.extend_from_slice(&rest[..payload_len]);
        let computed_crc = crc32_checksum(&framed);
        if stored_crc != computed_crc {
            return Err(WalError::Corrupted {
                offset: self.offset,
                message: format!("crc mismatch: stored {stored_crc:#x}, computed {computed_crc:#x}"),
            });
        }

        let msg: WalMessage = serde_json::from_slice(&rest[..payload_len])
            .map_err(|e| WalError::Corrupted {
                offset: self.offset,
                message: format!("undecodable payload: {e}"),
            })?;

        if msg.record_type() != record_type {
            return Err(WalError::Corrupted {
                offset: self.offset,
                message: "record type does not match payload".to_string(),
            });
        }

        self.offset += (HEADER_SIZE + payload_len + CRC_SIZE) as u64;
        Ok(Some(msg))
    }
}

/// Read every record in the file. Fails on the first damaged record.
pub fn read_all(path: &Path) -> WalResult<Vec<WalMessage>> {
    let mut reader = WalReader::open(path)?;
    let mut records = Vec::new();
    while let Some(msg) = reader.next()? {
        records.push(msg);
    }
    Ok(records)
}

/// The records following the last `EndHeight(height)` marker, or `None` if
/// that marker never appears.
pub fn records_after_end_height(records: &[WalMessage], height: u64) -> Option<&[WalMessage]> {
    let pos = records
        .iter()
        .rposition(|r| matches!(r, WalMessage::EndHeight(h) if *h == height))?;
    Some(&records[pos + 1..])
}

/// Best-effort repair: decode records from `src` until the first error and
/// re-encode the valid prefix into `dst`. Returns how many records survived.
pub fn repair_wal_file(src: &Path, dst: &Path) -> WalResult<usize> {
    let mut reader = WalReader::open(src)?;
    let tmp = dst.with_extension("repair-tmp");
    let mut out = BufWriter::new(File::create(&tmp)?);

    let mut kept = 0usize;
    loop {
        match reader.next() {
            Ok(Some(msg)) => {
                out.write_all(&encode_record(&msg)?)?;
                kept += 1;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, kept, "stopping wal repair at first undecodable record");
                break;
            }
        }
    }

    out.flush()?;
    out.get_ref().sync_data()?;
    drop(out);
    std::fs::rename(&tmp, dst)?;
    info!(kept, dst = %dst.display(), "rewrote wal from valid prefix");
    Ok(kept)
}

/// CRC32 (IEEE polynomial), table generated at compile time.
fn crc32_checksum(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = generate_crc32_table();
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        let index = ((crc ^ (*byte as u32)) & 0xFF) as usize;
        crc = TABLE[index] ^ (crc >> 8);
    }
    !crc
}

const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = 0xEDB8_8320 ^ (crc >> 1);
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round_state::Step;
    use crate::types::Message;
    use kestrel_types::{Address, BlockId, Proposal};
    use tempfile::tempdir;

    fn sample_records() -> Vec<WalMessage> {
        let proposal = Proposal::new(1, 0, -1, BlockId::nil(), 1000, Address::new([1u8; 20]));
        vec![
            WalMessage::MsgInfo(MsgInfo {
                msg: Message::Proposal(proposal),
                peer_id: Some("peer-1".to_string()),
                receive_time_ms: 1234,
            }),
            WalMessage::Timeout(TimeoutInfo {
                duration_ms: 3000,
                height: 1,
                round: 0,
                step: Step::Propose,
            }),
            WalMessage::EndHeight(1),
        ]
    }

    #[test]
    fn test_append_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consensus.wal");

        let records = sample_records();
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
            wal.flush_sync().unwrap();
        }

        assert_eq!(read_all(&path).unwrap(), records);
    }

    #[test]
    fn test_append_sync_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consensus.wal");

        let mut wal = Wal::open(&path).unwrap();
        wal.append_sync(&WalMessage::EndHeight(7)).unwrap();
        wal.close().unwrap();

        let mut wal = Wal::open(&path).unwrap();
        wal.append_sync(&WalMessage::EndHeight(8)).unwrap();
        drop(wal);

        assert_eq!(
            read_all(&path).unwrap(),
            vec![WalMessage::EndHeight(7), WalMessage::EndHeight(8)]
        );
    }

    #[test]
    fn test_closed_wal_rejects_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consensus.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.close().unwrap();
        assert!(matches!(
            wal.append(&WalMessage::EndHeight(1)),
            Err(WalError::Closed)
        ));
    }

    #[test]
    fn test_truncated_tail_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consensus.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &sample_records() {
                wal.append(r).unwrap();
            }
            wal.flush_sync().unwrap();
        }

        // Chop 17 bytes off the end.
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 17]).unwrap();

        let err = read_all(&path).unwrap_err();
        assert!(err.is_data_corruption(), "unexpected error: {err}");
    }

    #[test]
    fn test_flipped_byte_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consensus.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &sample_records() {
                wal.append(r).unwrap();
            }
            wal.flush_sync().unwrap();
        }

        let mut data = std::fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        assert!(read_all(&path).unwrap_err().is_data_corruption());
    }

    #[test]
    fn test_repair_keeps_valid_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consensus.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &sample_records() {
                wal.append(r).unwrap();
            }
            wal.flush_sync().unwrap();
        }

        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 17]).unwrap();

        let corrupted = path.with_extension("wal.CORRUPTED");
        std::fs::copy(&path, &corrupted).unwrap();
        let kept = repair_wal_file(&corrupted, &path).unwrap();
        assert_eq!(kept, 2);

        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records, sample_records()[..2]);
    }

    #[test]
    fn test_records_after_end_height() {
        let records = vec![
            WalMessage::EndHeight(1),
            WalMessage::Timeout(TimeoutInfo {
                duration_ms: 1,
                height: 2,
                round: 0,
                step: Step::NewHeight,
            }),
            WalMessage::EndHeight(2),
            WalMessage::Timeout(TimeoutInfo {
                duration_ms: 2,
                height: 3,
                round: 0,
                step: Step::NewHeight,
            }),
        ];

        let after = records_after_end_height(&records, 2).unwrap();
        assert_eq!(after.len(), 1);
        assert!(matches!(
            after[0],
            WalMessage::Timeout(TimeoutInfo { height: 3, .. })
        ));

        assert!(records_after_end_height(&records, 5).is_none());
    }

    #[test]
    fn test_crc32_known_vector() {
        assert_eq!(crc32_checksum(b"123456789"), 0xCBF43926);
    }
}
