//! Disk Journal
//!
//! Single append-only file of CRC-checked frames.
//!
//! # Frame Layout
//!
//! ```text
//! ┌────────────┬─────────┬──────────────────────────────────────┐
//! │ seq        │ 8 bytes │ Journal-wide monotonic sequence      │
//! │ checksum   │ 4 bytes │ CRC32 of payload                     │
//! │ payload_len│ 2 bytes │ Payload size (max 64KB)              │
//! │ status     │ 1 byte  │ TransactionStatus id                 │
//! │ version    │ 1 byte  │ Payload format version               │
//! ├────────────┴─────────┴──────────────────────────────────────┤
//! │ payload    bincode {gtrid, status, resources, timestamp_ms} │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Opening the file replays every frame to restore the next sequence and the
//! dangling set. Replay stops at the first incomplete or corrupted frame and
//! the file is truncated there. A failed append is cut back off the file, so
//! a torn frame can only ever be the last one.
//!
//! # Compaction
//!
//! Once the file reaches the compaction threshold, the next terminal record
//! triggers a rewrite that keeps only the records of dangling transactions
//! plus the newest record (which carries the sequence forward). The new file
//! is written beside the old one and renamed over it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{DanglingRecord, DanglingTracker, Journal, JournalRecord};
use crate::core_types::{Gtrid, SeqNum, now_ms};
use crate::error::JournalError;
use crate::status::TransactionStatus;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 16;

const PAYLOAD_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    seq: u64,
    checksum: u32,
    payload_len: u16,
    status: u8,
    version: u8,
}

impl FrameHeader {
    fn to_bytes(self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..14].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[14] = self.status;
        buf[15] = self.version;
        buf
    }

    fn from_bytes(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            seq: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            checksum: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            payload_len: u16::from_le_bytes([buf[12], buf[13]]),
            status: buf[14],
            version: buf[15],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordPayload {
    gtrid: Gtrid,
    status: TransactionStatus,
    resources: Vec<String>,
    timestamp_ms: u64,
}

#[inline]
fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn encode_frame(record: &JournalRecord) -> Result<Vec<u8>, JournalError> {
    let payload = bincode::serialize(&RecordPayload {
        gtrid: record.gtrid,
        status: record.status,
        resources: record.resources.clone(),
        timestamp_ms: record.timestamp_ms,
    })?;
    let payload_len = u16::try_from(payload.len()).map_err(|_| {
        JournalError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("journal payload of {} bytes exceeds frame limit", payload.len()),
        ))
    })?;

    let header = FrameHeader {
        seq: record.sequence,
        checksum: crc32_checksum(&payload),
        payload_len,
        status: record.status.id(),
        version: PAYLOAD_VERSION,
    };

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Outcome of reading one frame
enum Frame {
    Record(JournalRecord, usize),
    End,
    Torn(String),
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, JournalError> {
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    match read_full(reader, &mut header_buf)? {
        0 => return Ok(Frame::End),
        n if n < FRAME_HEADER_SIZE => return Ok(Frame::Torn(format!("{n}-byte header"))),
        _ => {}
    }
    let header = FrameHeader::from_bytes(&header_buf);

    let mut payload = vec![0u8; header.payload_len as usize];
    if read_full(reader, &mut payload)? < payload.len() {
        return Ok(Frame::Torn(format!("incomplete payload at seq {}", header.seq)));
    }
    if header.checksum != crc32_checksum(&payload) {
        return Ok(Frame::Torn(format!("checksum mismatch at seq {}", header.seq)));
    }

    let decoded: RecordPayload = bincode::deserialize(&payload)?;
    if decoded.status.id() != header.status {
        return Err(JournalError::Corrupted {
            seq: header.seq,
            reason: format!(
                "header status {} disagrees with payload status {}",
                header.status, decoded.status
            ),
        });
    }

    Ok(Frame::Record(
        JournalRecord {
            sequence: header.seq,
            gtrid: decoded.gtrid,
            status: decoded.status,
            resources: decoded.resources,
            timestamp_ms: decoded.timestamp_ms,
        },
        FRAME_HEADER_SIZE + payload.len(),
    ))
}

/// `read_exact` that reports how much was read instead of failing at EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

struct Replay {
    records: Vec<JournalRecord>,
    valid_len: u64,
    torn: Option<String>,
}

fn replay(path: &Path) -> Result<Replay, JournalError> {
    let mut replay = Replay {
        records: Vec::new(),
        valid_len: 0,
        torn: None,
    };
    if !path.exists() {
        return Ok(replay);
    }

    let mut reader = BufReader::new(File::open(path)?);
    loop {
        match read_frame(&mut reader)? {
            Frame::Record(record, len) => {
                replay.valid_len += len as u64;
                replay.records.push(record);
            }
            Frame::End => break,
            Frame::Torn(reason) => {
                replay.torn = Some(reason);
                break;
            }
        }
    }
    Ok(replay)
}

/// Read every intact record of a journal file without opening it for writes
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<JournalRecord>, JournalError> {
    Ok(replay(path.as_ref())?.records)
}

/// Dangling transactions of a journal file, leaving the file untouched
pub fn read_dangling(
    path: impl AsRef<Path>,
) -> Result<FxHashMap<Gtrid, DanglingRecord>, JournalError> {
    let mut dangling = DanglingTracker::default();
    for record in &read_records(path)? {
        dangling.apply(record);
    }
    Ok(dangling.snapshot())
}

struct DiskState {
    file: File,
    /// Length of the intact frames
    len: u64,
    next_seq: SeqNum,
    dangling: DanglingTracker,
    /// File length that triggers the next compaction; 0 never compacts
    compact_at: u64,
    closed: bool,
    /// Cut the next frame short after this many bytes
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl DiskState {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
        }
        self.file.write_all(frame)
    }

    /// Append one frame. On failure the file is cut back to its intact
    /// length; if even that fails the journal refuses further records.
    fn append(&mut self, frame: &[u8], sync: bool) -> Result<(), JournalError> {
        let mut result = self.write_frame(frame);
        if result.is_ok() && sync {
            result = self.file.sync_data();
        }

        match result {
            Ok(()) => {
                self.len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(truncate_err) = self.file.set_len(self.len) {
                    self.closed = true;
                    error!(
                        error = %e,
                        truncate_error = %truncate_err,
                        "Journal append failed and cannot be undone, journal closed"
                    );
                } else {
                    warn!(error = %e, len = self.len, "Journal append failed, frame discarded");
                }
                Err(e.into())
            }
        }
    }
}

/// File-backed journal
pub struct DiskJournal {
    path: PathBuf,
    force_sync: bool,
    compact_threshold: u64,
    state: Mutex<DiskState>,
}

impl DiskJournal {
    /// Open (or create) the journal at `path`, replaying existing records
    pub fn open(path: impl AsRef<Path>, force_sync: bool) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let Replay {
            records,
            valid_len,
            torn,
        } = replay(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        if let Some(reason) = torn {
            warn!(
                path = %path.display(),
                valid_len,
                reason = %reason,
                "Journal has a torn tail, truncating"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let mut dangling = DanglingTracker::default();
        let mut last_seq = 0;
        for record in &records {
            dangling.apply(record);
            last_seq = last_seq.max(record.sequence);
        }

        info!(
            path = %path.display(),
            records = records.len(),
            next_seq = last_seq + 1,
            "Journal opened"
        );

        Ok(Self {
            path,
            force_sync,
            compact_threshold: 0,
            state: Mutex::new(DiskState {
                file,
                len: valid_len,
                next_seq: last_seq + 1,
                dangling,
                compact_at: 0,
                closed: false,
                #[cfg(test)]
                fail_after: None,
            }),
        })
    }

    /// Compact once the file reaches `bytes`; 0 disables compaction
    pub fn with_compaction_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self.lock().compact_at = bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the intact records on disk
    pub fn file_len(&self) -> u64 {
        self.lock().len
    }

    /// Rewrite the file with only the records still needed, returning how
    /// many were kept
    pub fn compact(&self) -> Result<usize, JournalError> {
        let mut state = self.lock();
        if state.closed {
            return Err(JournalError::Closed);
        }
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut DiskState) -> Result<usize, JournalError> {
        let before = state.len;
        let last_seq = state.next_seq.saturating_sub(1);
        let kept: Vec<JournalRecord> = replay(&self.path)?
            .records
            .into_iter()
            .filter(|r| state.dangling.contains(r.gtrid) || r.sequence == last_seq)
            .collect();

        let tmp_path = self.path.with_extension("compact");
        let mut len = 0u64;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for record in &kept {
                let frame = encode_frame(record)?;
                writer.write_all(&frame)?;
                len += frame.len() as u64;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        state.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        state.len = len;
        if self.compact_threshold > 0 {
            state.compact_at = self.compact_threshold.max(len.saturating_mul(2));
        }

        info!(
            path = %self.path.display(),
            kept = kept.len(),
            before,
            after = len,
            "Journal compacted"
        );
        Ok(kept.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Journal for DiskJournal {
    fn log(
        &self,
        gtrid: Gtrid,
        status: TransactionStatus,
        resources: &[String],
    ) -> Result<SeqNum, JournalError> {
        let mut state = self.lock();
        if state.closed {
            return Err(JournalError::Closed);
        }

        let record = JournalRecord {
            sequence: state.next_seq,
            gtrid,
            status,
            resources: resources.to_vec(),
            timestamp_ms: now_ms(),
        };
        let frame = encode_frame(&record)?;
        state.append(&frame, self.force_sync && status.requires_durability())?;

        state.next_seq += 1;
        state.dangling.apply(&record);
        debug!(gtrid = %gtrid, status = %status, seq = record.sequence, "Journal record");

        if status.is_terminal()
            && state.compact_at > 0
            && state.len >= state.compact_at
            && let Err(e) = self.compact_locked(&mut state)
        {
            warn!(path = %self.path.display(), error = %e, "Journal compaction failed");
        }
        Ok(record.sequence)
    }

    fn collect_dangling_records(&self) -> Result<FxHashMap<Gtrid, DanglingRecord>, JournalError> {
        Ok(self.lock().dangling.snapshot())
    }

    fn close(&self) -> Result<(), JournalError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.file.flush()?;
        state.file.sync_all()?;
        info!(path = %self.path.display(), "Journal closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Decision;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("xa_journal_{}", ulid::Ulid::new()))
            .join("tm.journal")
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_header_size() {
        let header = FrameHeader {
            seq: 7,
            checksum: 0xdead_beef,
            payload_len: 300,
            status: 5,
            version: PAYLOAD_VERSION,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
        assert_eq!(FrameHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_reopen_restores_sequence_and_dangling() {
        let path = temp_path();
        let done = Gtrid::from_raw(10);
        let pending = Gtrid::from_raw(11);

        {
            let journal = DiskJournal::open(&path, true).unwrap();
            journal.log(done, TransactionStatus::Preparing, &names(&["a"])).unwrap();
            journal.log(done, TransactionStatus::Committed, &names(&["a"])).unwrap();
            journal
                .log(pending, TransactionStatus::Committing, &names(&["a", "b"]))
                .unwrap();
            journal.close().unwrap();
        }

        let journal = DiskJournal::open(&path, true).unwrap();
        let dangling = journal.collect_dangling_records().unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[&pending].decision, Some(Decision::Commit));
        assert_eq!(dangling[&pending].resources, names(&["a", "b"]));

        let seq = journal.log(pending, TransactionStatus::Committed, &[]).unwrap();
        assert_eq!(seq, 4);
        assert!(journal.collect_dangling_records().unwrap().is_empty());

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].status, TransactionStatus::Committed);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let path = temp_path();
        let gtrid = Gtrid::from_raw(42);
        {
            let journal = DiskJournal::open(&path, false).unwrap();
            journal.log(gtrid, TransactionStatus::Preparing, &names(&["a"])).unwrap();
            journal.log(gtrid, TransactionStatus::Unknown, &names(&["a"])).unwrap();
        }

        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[1, 2, 3, 4, 5]).unwrap();
        }

        let journal = DiskJournal::open(&path, false).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
        let dangling = journal.collect_dangling_records().unwrap();
        assert_eq!(dangling[&gtrid].last_status, TransactionStatus::Unknown);
        assert_eq!(journal.log(gtrid, TransactionStatus::RolledBack, &[]).unwrap(), 3);
    }

    #[test]
    fn test_failed_append_keeps_later_records() {
        let path = temp_path();
        let gtrid = Gtrid::from_raw(8);
        {
            let journal = DiskJournal::open(&path, true).unwrap();
            journal.log(gtrid, TransactionStatus::Preparing, &names(&["a"])).unwrap();
            let intact = journal.file_len();

            journal.lock().fail_after = Some(8);
            assert!(journal.log(gtrid, TransactionStatus::Prepared, &names(&["a"])).is_err());
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);

            let seq = journal
                .log(gtrid, TransactionStatus::Committing, &names(&["a"]))
                .unwrap();
            assert_eq!(seq, 2);
            journal.close().unwrap();
        }

        let statuses: Vec<_> = read_records(&path)
            .unwrap()
            .into_iter()
            .map(|r| (r.sequence, r.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (1, TransactionStatus::Preparing),
                (2, TransactionStatus::Committing)
            ]
        );

        let journal = DiskJournal::open(&path, true).unwrap();
        let dangling = journal.collect_dangling_records().unwrap();
        assert_eq!(dangling[&gtrid].decision, Some(Decision::Commit));
    }

    #[test]
    fn test_read_only_scan_leaves_torn_tail() {
        let path = temp_path();
        let gtrid = Gtrid::from_raw(9);
        {
            let journal = DiskJournal::open(&path, false).unwrap();
            journal.log(gtrid, TransactionStatus::Committing, &names(&["a"])).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[7; 5]).unwrap();
        }
        let torn_len = fs::metadata(&path).unwrap().len();

        let dangling = read_dangling(&path).unwrap();
        assert_eq!(dangling[&gtrid].decision, Some(Decision::Commit));
        assert_eq!(read_records(&path).unwrap().len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), torn_len);
    }

    #[test]
    fn test_compaction_keeps_dangling_and_sequence() {
        let path = temp_path();
        let done = Gtrid::from_raw(1);
        let pending = Gtrid::from_raw(2);
        let journal = DiskJournal::open(&path, false).unwrap();

        journal.log(pending, TransactionStatus::Preparing, &names(&["a"])).unwrap();
        journal.log(pending, TransactionStatus::Committing, &names(&["a", "b"])).unwrap();
        for status in [
            TransactionStatus::Active,
            TransactionStatus::Preparing,
            TransactionStatus::Prepared,
            TransactionStatus::Committing,
            TransactionStatus::Committed,
        ] {
            journal.log(done, status, &names(&["a"])).unwrap();
        }
        let before = journal.file_len();

        // Both records of the pending transaction plus the newest one
        assert_eq!(journal.compact().unwrap(), 3);
        assert!(journal.file_len() < before);
        assert_eq!(fs::metadata(&path).unwrap().len(), journal.file_len());
        assert_eq!(journal.log(pending, TransactionStatus::Committed, &[]).unwrap(), 8);
        drop(journal);

        let sequences: Vec<_> = read_records(&path).unwrap().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 7, 8]);

        let journal = DiskJournal::open(&path, false).unwrap();
        assert!(journal.collect_dangling_records().unwrap().is_empty());
        assert_eq!(journal.log(done, TransactionStatus::Active, &[]).unwrap(), 9);
    }

    #[test]
    fn test_threshold_triggers_compaction() {
        let path = temp_path();
        let journal = DiskJournal::open(&path, false)
            .unwrap()
            .with_compaction_threshold(1);

        for raw in 1..=3 {
            let gtrid = Gtrid::from_raw(raw);
            journal.log(gtrid, TransactionStatus::Preparing, &names(&["a"])).unwrap();
            journal.log(gtrid, TransactionStatus::RolledBack, &names(&["a"])).unwrap();
        }

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 6);
        assert!(journal.collect_dangling_records().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_payload_stops_replay() {
        let path = temp_path();
        let gtrid = Gtrid::from_raw(5);
        {
            let journal = DiskJournal::open(&path, false).unwrap();
            journal.log(gtrid, TransactionStatus::Preparing, &names(&["a"])).unwrap();
            journal.log(gtrid, TransactionStatus::Prepared, &names(&["a"])).unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TransactionStatus::Preparing);
    }
}
