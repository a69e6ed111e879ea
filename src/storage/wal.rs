//! Write-ahead log.
//!
//! Every mutation is framed and appended here before it becomes visible to
//! readers. Records are laid out as
//! `[crc:4][op:1][key_len:2][payload_len:4][key][payload]`, little-endian,
//! with the CRC-32 computed over `[op][key][payload]`. A `Batch` record
//! carries several sub-operations in one frame, which is what makes a
//! value-plus-meta commit atomic: after a crash either the whole frame
//! replays or none of it does.
//!
//! Recovery replays the file from offset zero and stops at the first short
//! read, truncated frame, or checksum mismatch — the tail past that point
//! is treated as an interrupted write and discarded. A stored CRC of zero
//! with a non-zero computed value is tolerated with a warning for logs
//! written before checksumming was enforced.

use crate::core::error::{MeridianError, MeridianResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Framed header size: crc(4) + op(1) + key_len(2) + payload_len(4).
const HEADER_LEN: usize = 11;

/// Upper bound on a single record payload. Anything larger is treated as a
/// corrupt length field during recovery.
const MAX_PAYLOAD_LEN: u32 = 256 * 1024 * 1024;

/// Operation tags stored in the record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    /// Whole-value write.
    Put = 1,
    /// In-place integer field patch, payload `field:value`.
    PatchI64 = 2,
    /// Tombstone write; payload is empty.
    Delete = 3,
    /// Atomic group of sub-operations.
    Batch = 4,
    /// In-place string field patch, payload `field:value`.
    PatchStr = 5,
}

impl WalOp {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Put),
            2 => Some(Self::PatchI64),
            3 => Some(Self::Delete),
            4 => Some(Self::Batch),
            5 => Some(Self::PatchStr),
            _ => None,
        }
    }
}

/// One sub-operation of an atomic batch.
#[derive(Debug, Clone)]
pub struct BatchOp {
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BatchOp {
    /// A `Put` sub-operation.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: WalOp::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    /// A `Delete` sub-operation.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: WalOp::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    /// A field-patch sub-operation with the `field:value` payload framing.
    pub fn patch(op: WalOp, key: impl Into<Vec<u8>>, field: &str, value: &str) -> Self {
        debug_assert!(matches!(op, WalOp::PatchI64 | WalOp::PatchStr));
        let mut payload = Vec::with_capacity(field.len() + 1 + value.len());
        payload.extend_from_slice(field.as_bytes());
        payload.push(b':');
        payload.extend_from_slice(value.as_bytes());
        Self {
            op,
            key: key.into(),
            value: payload,
        }
    }
}

/// Counters describing WAL activity since open.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WalStats {
    /// Records framed and handed to the OS.
    pub records_appended: u64,
    /// Bytes written, including frame headers.
    pub bytes_appended: u64,
    /// Batch records among the appends.
    pub batches_appended: u64,
    /// Explicit fsync calls.
    pub flushes: u64,
    /// Records replayed by the last recovery, counting batch sub-operations.
    pub records_recovered: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    records_appended: AtomicU64,
    bytes_appended: AtomicU64,
    batches_appended: AtomicU64,
    flushes: AtomicU64,
    records_recovered: AtomicU64,
}

/// Append-only write-ahead log over a single file.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<File>,
    stats: StatCounters,
}

impl WriteAheadLog {
    /// Open (or create) the log at `path`. Fatal if the file cannot be
    /// opened; parent directories are created as needed.
    pub fn open(path: impl Into<PathBuf>) -> MeridianResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MeridianError::durability("creating log directory", e))?;
            }
        }
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| MeridianError::durability("opening log file", e))?;
        info!(path = %path.display(), "write-ahead log opened");
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            stats: StatCounters::default(),
        })
    }

    /// The log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one framed record. On return the bytes have been handed to
    /// the OS; call [`flush`](Self::flush) for fsync durability.
    pub fn append(&self, op: WalOp, key: &[u8], payload: &[u8]) -> MeridianResult<()> {
        if key.len() > u16::MAX as usize {
            return Err(MeridianError::decode(format!(
                "key length {} exceeds the frame limit",
                key.len()
            )));
        }
        let crc = record_crc(op as u8, key, payload);

        let mut frame = Vec::with_capacity(HEADER_LEN + key.len() + payload.len());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.push(op as u8);
        frame.extend_from_slice(&(key.len() as u16).to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(key);
        frame.extend_from_slice(payload);

        let mut writer = self.writer.lock();
        writer
            .write_all(&frame)
            .map_err(|e| MeridianError::durability("appending record", e))?;
        drop(writer);

        self.stats.records_appended.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_appended
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Frame the sub-operations as one atomic `Batch` record and append it.
    pub fn append_batch(&self, ops: &[BatchOp]) -> MeridianResult<()> {
        let mut payload = Vec::with_capacity(
            4 + ops
                .iter()
                .map(|op| 1 + 2 + op.key.len() + 4 + op.value.len())
                .sum::<usize>(),
        );
        payload.extend_from_slice(&(ops.len() as u32).to_le_bytes());
        for op in ops {
            if op.key.len() > u16::MAX as usize {
                return Err(MeridianError::decode(format!(
                    "key length {} exceeds the frame limit",
                    op.key.len()
                )));
            }
            payload.push(op.op as u8);
            payload.extend_from_slice(&(op.key.len() as u16).to_le_bytes());
            payload.extend_from_slice(&op.key);
            payload.extend_from_slice(&(op.value.len() as u32).to_le_bytes());
            payload.extend_from_slice(&op.value);
        }
        self.append(WalOp::Batch, b"", &payload)?;
        self.stats.batches_appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fsync the file.
    pub fn flush(&self) -> MeridianResult<()> {
        let writer = self.writer.lock();
        writer
            .sync_all()
            .map_err(|e| MeridianError::durability("syncing log file", e))?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current activity counters.
    pub fn stats(&self) -> WalStats {
        WalStats {
            records_appended: self.stats.records_appended.load(Ordering::Relaxed),
            bytes_appended: self.stats.bytes_appended.load(Ordering::Relaxed),
            batches_appended: self.stats.batches_appended.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            records_recovered: self.stats.records_recovered.load(Ordering::Relaxed),
        }
    }

    /// Replay the log from the start, invoking `cb` for every record and,
    /// for batches, every sub-operation in order.
    ///
    /// A callback error skips that record and continues; frame-level
    /// corruption ends the replay at the last intact record. Returns the
    /// number of operations handed to the callback. Must run before any
    /// append — the caller sequences recovery ahead of live writes.
    pub fn recover<F>(&self, mut cb: F) -> MeridianResult<u64>
    where
        F: FnMut(WalOp, &[u8], &[u8]) -> MeridianResult<()>,
    {
        let file = File::open(&self.path)
            .map_err(|e| MeridianError::durability("opening log for recovery", e))?;
        let mut reader = BufReader::new(file);
        let mut replayed = 0u64;
        let mut offset = 0u64;

        loop {
            let mut header = [0u8; HEADER_LEN];
            match read_exact_or_eof(&mut reader, &mut header) {
                ReadOutcome::Full => {}
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => {
                    warn!(offset, "truncated record header; discarding tail");
                    break;
                }
                ReadOutcome::Err(e) => {
                    return Err(MeridianError::durability("reading log during recovery", e))
                }
            }

            let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let op_byte = header[4];
            let key_len = u16::from_le_bytes([header[5], header[6]]) as usize;
            let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
            if payload_len > MAX_PAYLOAD_LEN {
                warn!(offset, payload_len, "implausible payload length; discarding tail");
                break;
            }

            let mut key = vec![0u8; key_len];
            let mut payload = vec![0u8; payload_len as usize];
            if !matches!(read_exact_or_eof(&mut reader, &mut key), ReadOutcome::Full)
                || !matches!(
                    read_exact_or_eof(&mut reader, &mut payload),
                    ReadOutcome::Full
                )
            {
                warn!(offset, "truncated record body; discarding tail");
                break;
            }

            let computed = record_crc(op_byte, &key, &payload);
            if computed != stored_crc {
                if stored_crc == 0 {
                    warn!(offset, "zero checksum accepted (legacy record)");
                } else {
                    warn!(
                        offset,
                        stored_crc, computed, "checksum mismatch; discarding tail"
                    );
                    break;
                }
            }

            let Some(op) = WalOp::from_u8(op_byte) else {
                warn!(offset, op_byte, "unknown operation tag; discarding tail");
                break;
            };

            offset += (HEADER_LEN + key_len + payload_len as usize) as u64;

            if op == WalOp::Batch {
                replayed += replay_batch(&payload, &mut cb);
            } else {
                match cb(op, &key, &payload) {
                    Ok(()) => replayed += 1,
                    Err(e) => warn!(error = %e, "skipping unreplayable record"),
                }
            }
        }

        self.stats
            .records_recovered
            .store(replayed, Ordering::Relaxed);
        debug!(replayed, offset, "recovery complete");
        Ok(replayed)
    }
}

/// Replay the sub-operations of one batch payload. The payload has already
/// passed the record checksum, so a malformed interior means the writer was
/// broken, not the disk; parsing stops at the first inconsistency.
fn replay_batch<F>(payload: &[u8], cb: &mut F) -> u64
where
    F: FnMut(WalOp, &[u8], &[u8]) -> MeridianResult<()>,
{
    let mut replayed = 0u64;
    if payload.len() < 4 {
        warn!("batch record too small; skipping");
        return 0;
    }
    let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let mut pos = 4usize;

    for _ in 0..count {
        if pos + 1 + 2 > payload.len() {
            warn!("batch interior truncated; skipping remainder");
            break;
        }
        let op_byte = payload[pos];
        pos += 1;
        let key_len = u16::from_le_bytes([payload[pos], payload[pos + 1]]) as usize;
        pos += 2;
        if pos + key_len + 4 > payload.len() {
            warn!("batch interior truncated; skipping remainder");
            break;
        }
        let key = &payload[pos..pos + key_len];
        pos += key_len;
        let value_len =
            u32::from_le_bytes([payload[pos], payload[pos + 1], payload[pos + 2], payload[pos + 3]])
                as usize;
        pos += 4;
        if pos + value_len > payload.len() {
            warn!("batch interior truncated; skipping remainder");
            break;
        }
        let value = &payload[pos..pos + value_len];
        pos += value_len;

        let Some(op) = WalOp::from_u8(op_byte) else {
            warn!(op_byte, "unknown operation tag in batch; skipping remainder");
            break;
        };
        match cb(op, key, value) {
            Ok(()) => replayed += 1,
            Err(e) => warn!(error = %e, "skipping unreplayable batch operation"),
        }
    }
    replayed
}

/// CRC-32 (reflected, 0xEDB88320) over `[op][key][payload]`.
fn record_crc(op: u8, key: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[op]);
    hasher.update(key);
    hasher.update(payload);
    hasher.finalize()
}

enum ReadOutcome {
    Full,
    Eof,
    Partial,
    Err(std::io::Error),
}

/// `read_exact` distinguishing clean EOF (no bytes) from a torn tail.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                }
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Err(e),
        }
    }
    ReadOutcome::Full
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal() -> (tempfile::TempDir, WriteAheadLog) {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal")).unwrap();
        (dir, wal)
    }

    #[test]
    fn append_and_recover_in_order() {
        let (_dir, wal) = temp_wal();
        wal.append(WalOp::Put, b"a", b"1").unwrap();
        wal.append(WalOp::Put, b"b", b"2").unwrap();
        wal.append(WalOp::Delete, b"a", b"").unwrap();
        wal.flush().unwrap();

        let mut seen = Vec::new();
        let replayed = wal
            .recover(|op, key, payload| {
                seen.push((op, key.to_vec(), payload.to_vec()));
                Ok(())
            })
            .unwrap();

        assert_eq!(replayed, 3);
        assert_eq!(seen[0], (WalOp::Put, b"a".to_vec(), b"1".to_vec()));
        assert_eq!(seen[1], (WalOp::Put, b"b".to_vec(), b"2".to_vec()));
        assert_eq!(seen[2], (WalOp::Delete, b"a".to_vec(), b"".to_vec()));
    }

    #[test]
    fn batch_replays_every_sub_operation() {
        let (_dir, wal) = temp_wal();
        wal.append_batch(&[
            BatchOp::put(b"k".as_slice(), b"v".as_slice()),
            BatchOp::put(b"k:meta".as_slice(), br#"{"ts":1}"#.as_slice()),
        ])
        .unwrap();

        let mut keys = Vec::new();
        let replayed = wal
            .recover(|_, key, _| {
                keys.push(key.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(keys, vec![b"k".to_vec(), b"k:meta".to_vec()]);
    }

    #[test]
    fn callback_error_skips_only_that_record() {
        let (_dir, wal) = temp_wal();
        wal.append(WalOp::Put, b"good", b"1").unwrap();
        wal.append(WalOp::Put, b"bad", b"1").unwrap();
        wal.append(WalOp::Put, b"also-good", b"1").unwrap();

        let mut seen = Vec::new();
        let replayed = wal
            .recover(|_, key, _| {
                if key == b"bad" {
                    return Err(MeridianError::decode("refused"));
                }
                seen.push(key.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(seen, vec![b"good".to_vec(), b"also-good".to_vec()]);
    }

    #[test]
    fn corrupt_record_truncates_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let wal = WriteAheadLog::open(&path).unwrap();
            wal.append(WalOp::Put, b"a", b"1").unwrap();
            wal.append(WalOp::Put, b"b", b"2").unwrap();
            wal.append(WalOp::Put, b"c", b"3").unwrap();
            wal.flush().unwrap();
        }

        // Flip a payload byte in the middle record.
        let mut bytes = std::fs::read(&path).unwrap();
        let record_len = HEADER_LEN + 1 + 1;
        bytes[record_len + HEADER_LEN] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let wal = WriteAheadLog::open(&path).unwrap();
        let mut keys = Vec::new();
        wal.recover(|_, key, _| {
            keys.push(key.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn stats_track_appends_and_flushes() {
        let (_dir, wal) = temp_wal();
        wal.append(WalOp::Put, b"k", b"v").unwrap();
        wal.append_batch(&[BatchOp::put(b"a".as_slice(), b"b".as_slice())])
            .unwrap();
        wal.flush().unwrap();

        let stats = wal.stats();
        assert_eq!(stats.records_appended, 2);
        assert_eq!(stats.batches_appended, 1);
        assert_eq!(stats.flushes, 1);
        assert!(stats.bytes_appended > 0);
    }
}
