//! Write-ahead log for the content store.
//!
//! Format: each entry is `[4-byte CRC32][4-byte length][JSON payload]\n`.
//! On recovery, replay all valid entries. Corrupt tail entries are truncated.

use crate::element::DataElement;
use crate::fragment::MAX_ELEMENT_BYTES;
use crate::index::FileHead;
use cellstore_common::ExtendedId;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Largest payload a frame header may claim. JSON spends up to four bytes
/// per element payload byte; anything larger is treated as a torn tail.
const MAX_FRAME_BYTES: u64 = MAX_ELEMENT_BYTES * 4 + 64 * 1024;
const FRAME_OVERHEAD: u64 = 9;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One durable state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalEntry {
    /// A new data element. Elements are write-once.
    Element(DataElement),
    /// The full committed head of a file, replacing any earlier one.
    Head(FileHead),
    /// An element that is no longer reachable and has been dropped.
    Reclaim { id: ExtendedId },
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every write.
    Always,
    /// Fsync periodically (caller controls).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// Entries recovered from a WAL file.
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<WalEntry>,
    /// Length of the valid prefix. Bytes past it belong to a torn or
    /// corrupt tail.
    pub valid_len: u64,
}

/// An append-only write-ahead log.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    fsync: FsyncPolicy,
    entries_written: u64,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            fsync,
            entries_written: 0,
        })
    }

    /// Replay `path`, cut off any corrupt tail, and open it for appending.
    ///
    /// New entries must land directly after the last valid frame, otherwise
    /// the next replay would stop at the old garbage and never reach them.
    pub fn recover(path: &Path, fsync: FsyncPolicy) -> Result<(Self, Vec<WalEntry>), WalError> {
        let replay = Self::replay(path)?;
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > replay.valid_len {
                tracing::warn!(
                    dropped = meta.len() - replay.valid_len,
                    "truncating corrupt WAL tail at {:?}",
                    path
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(replay.valid_len)?;
                file.sync_all()?;
            }
        }
        Ok((Self::open(path, fsync)?, replay.entries))
    }

    /// Append an entry to the WAL.
    pub fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
        let payload = serde_json::to_vec(entry)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.push(b'\n');
        self.writer.write_all(&frame)?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of entries written since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Replay all valid entries from a WAL file.
    /// Returns the entries in order. Stops at the first torn or corrupt entry.
    pub fn replay(path: &Path) -> Result<Replay, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        while let Some(frame) = read_frame(&mut reader, replay.entries.len())? {
            replay.entries.push(serde_json::from_slice(&frame)?);
            replay.valid_len += frame.len() as u64 + FRAME_OVERHEAD;
        }

        Ok(replay)
    }
}

/// Read one `[crc][len][payload]\n` frame. `None` on clean EOF, on a torn
/// tail, or on a CRC mismatch; replay stops there in all three cases.
fn read_frame(reader: &mut impl Read, index: usize) -> Result<Option<Vec<u8>>, WalError> {
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header[..4]) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WalError::Io(e)),
    }

    let torn = |res: io::Result<()>| -> Result<bool, WalError> {
        match res {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!(entry = index, "WAL truncated mid-entry; stopping replay");
                Ok(true)
            }
            Err(e) => Err(WalError::Io(e)),
        }
    };

    if torn(reader.read_exact(&mut header[4..]))? {
        return Ok(None);
    }
    let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
    if len > MAX_FRAME_BYTES {
        tracing::warn!(entry = index, len, "WAL frame length out of range; stopping replay");
        return Ok(None);
    }

    // payload plus trailing newline; grows with the bytes actually present
    let mut payload = Vec::new();
    reader.by_ref().take(len + 1).read_to_end(&mut payload)?;
    if payload.len() as u64 != len + 1 {
        tracing::warn!(entry = index, "WAL truncated mid-entry; stopping replay");
        return Ok(None);
    }
    payload.truncate(len as usize);

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let actual = hasher.finalize();
    if actual != expected {
        tracing::warn!(
            entry = index,
            "WAL CRC mismatch: expected {:#010x}, got {:#010x}; stopping replay",
            expected,
            actual
        );
        return Ok(None);
    }
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blob(payload: &str) -> WalEntry {
        WalEntry::Element(DataElement::blob(
            ExtendedId::random(),
            payload.as_bytes().to_vec(),
        ))
    }

    fn payload_of(entry: &WalEntry) -> &[u8] {
        match entry {
            WalEntry::Element(el) => &el.payload,
            other => panic!("expected element, got {other:?}"),
        }
    }

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&blob("v1")).unwrap();
            wal.append(&blob("v2")).unwrap();
            wal.append(&blob("v3")).unwrap();
            assert_eq!(wal.entries_written(), 3);
        }

        let entries = Wal::replay(&wal_path).unwrap().entries;
        assert_eq!(entries.len(), 3);
        assert_eq!(payload_of(&entries[0]), b"v1");
        assert_eq!(payload_of(&entries[1]), b"v2");
        assert_eq!(payload_of(&entries[2]), b"v3");
    }

    #[test]
    fn test_wal_replay_empty() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("empty.wal");
        let replay = Wal::replay(&wal_path).unwrap();
        assert!(replay.entries.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn test_wal_replay_truncated() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&blob("v1")).unwrap();
            wal.append(&blob("v2")).unwrap();
            wal.append(&blob("v3")).unwrap();
        }

        // chop the tail of the last entry
        {
            let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 5).unwrap();
        }

        let entries = Wal::replay(&wal_path).unwrap().entries;
        assert_eq!(
            entries.len(),
            2,
            "should recover 2 of 3 entries after truncation"
        );
        assert_eq!(payload_of(&entries[1]), b"v2");
    }

    #[test]
    fn test_wal_crc_mismatch_stops_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("crc.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&blob("v1")).unwrap();
            wal.append(&blob("v2")).unwrap();
        }

        // flip a byte inside the second payload
        let mut bytes = std::fs::read(&wal_path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xff;
        std::fs::write(&wal_path, bytes).unwrap();

        let entries = Wal::replay(&wal_path).unwrap().entries;
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_wal_head_and_reclaim_entries() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("head.wal");

        let head = FileHead::new("/doc.docx".to_string(), 42);
        let gone = ExtendedId::random();
        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalEntry::Head(head.clone())).unwrap();
            wal.append(&WalEntry::Reclaim { id: gone }).unwrap();
        }

        let entries = Wal::replay(&wal_path).unwrap().entries;
        assert_eq!(
            entries,
            vec![WalEntry::Head(head), WalEntry::Reclaim { id: gone }]
        );
    }

    #[test]
    fn test_recover_truncates_garbage_tail() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("tail.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&blob("v1")).unwrap();
        }
        let good_len = std::fs::metadata(&wal_path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap();
        }
        assert_eq!(Wal::replay(&wal_path).unwrap().valid_len, good_len);

        {
            let (mut wal, entries) = Wal::recover(&wal_path, FsyncPolicy::Always).unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), good_len);
            wal.append(&blob("v2")).unwrap();
        }

        let entries = Wal::replay(&wal_path).unwrap().entries;
        assert_eq!(entries.len(), 2);
        assert_eq!(payload_of(&entries[1]), b"v2");
    }

    #[test]
    fn test_oversized_length_is_a_torn_tail() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("huge.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&blob("v1")).unwrap();
        }
        let good_len = std::fs::metadata(&wal_path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.write_all(&u32::MAX.to_le_bytes()).unwrap();
            file.write_all(b"junk").unwrap();
        }

        let replay = Wal::replay(&wal_path).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.valid_len, good_len);
    }
}
