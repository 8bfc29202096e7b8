//! Append-only, hash-indexed log of confirmed action payloads.
//!
//! File layout: `[u16 LE length][length bytes payload]` frames from offset
//! zero, no header, no trailer. The sequence→offset table and the
//! hash→sequences index are rebuilt by a full scan on every open; the index
//! function is injected so the log stays agnostic of the payload format.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use crate::crypto::Hash;
use crate::types::{Result, SafeError};

/// Derives the index hashes for one payload.
pub type Indexer = Box<dyn Fn(&[u8]) -> Vec<Hash> + Send + Sync>;

/// Frame payloads are length-prefixed with a u16.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

struct FrameRef {
    /// Offset of the length prefix; the payload starts 2 bytes later.
    offset: u64,
    length: u16,
}

pub struct ActionLog {
    file: File,
    frames: Vec<FrameRef>,
    index: HashMap<Hash, Vec<usize>>,
    indexer: Indexer,
}

impl ActionLog {
    /// Open the log at `path`, creating it when absent, and rebuild the
    /// offset table and hash index by replay.
    ///
    /// A partial trailing frame (from an interrupted append) is discarded
    /// with a warning and the file truncated back to the last whole frame.
    pub fn open(path: &Path, indexer: Indexer) -> Result<ActionLog> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut frames = Vec::new();
        let mut index: HashMap<Hash, Vec<usize>> = HashMap::new();
        let mut pos = 0usize;
        while pos < data.len() {
            if data.len() - pos < 2 {
                break; // partial length prefix
            }
            let length = u16::from_le_bytes([data[pos], data[pos + 1]]);
            if data.len() - pos - 2 < length as usize {
                break; // partial trailing frame
            }
            let payload = &data[pos + 2..pos + 2 + length as usize];
            let sequence = frames.len();
            for hash in (indexer)(payload) {
                index.entry(hash).or_default().push(sequence);
            }
            frames.push(FrameRef {
                offset: pos as u64,
                length,
            });
            pos += 2 + length as usize;
        }
        if pos < data.len() {
            warn!(
                dropped = data.len() - pos,
                "action log has a truncated trailing frame, discarding"
            );
            file.set_len(pos as u64)?;
        }

        Ok(ActionLog {
            file,
            frames,
            index,
            indexer,
        })
    }

    /// Number of stored actions; also the next sequence number.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Append one payload as a length-prefixed frame.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(SafeError::PayloadTooLarge(payload.len()));
        }
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);

        let offset = self.file.seek(SeekFrom::End(0))?;
        let wrote = self.file.write(&frame)?;
        if wrote != frame.len() {
            // No rollback; the next open drops the partial tail.
            return Err(SafeError::ShortWrite {
                wrote,
                expected: frame.len(),
            });
        }
        self.file.sync_data()?;

        let sequence = self.frames.len();
        for hash in (self.indexer)(payload) {
            self.index.entry(hash).or_default().push(sequence);
        }
        self.frames.push(FrameRef {
            offset,
            length: payload.len() as u16,
        });
        Ok(())
    }

    /// The payload at a sequence number, read back from disk.
    pub fn payload_at(&mut self, sequence: usize) -> Result<Vec<u8>> {
        let frame = self.frames.get(sequence).ok_or_else(|| {
            SafeError::CorruptLog(format!("sequence {sequence} out of range"))
        })?;
        let mut payload = vec![0u8; frame.length as usize];
        self.file.seek(SeekFrom::Start(frame.offset + 2))?;
        self.file.read_exact(&mut payload).map_err(|e| {
            SafeError::CorruptLog(format!(
                "frame {sequence} unreadable at offset {}: {e}",
                frame.offset
            ))
        })?;
        Ok(payload)
    }

    /// Every payload indexed under `hash`, in original append order.
    pub fn lookup_by_hash(&mut self, hash: &Hash) -> Result<Vec<Vec<u8>>> {
        let sequences = match self.index.get(hash) {
            Some(sequences) => sequences.clone(),
            None => return Ok(Vec::new()),
        };
        let mut payloads = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            payloads.push(self.payload_at(sequence)?);
        }
        Ok(payloads)
    }

    /// Flush and release the backing file.
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_of;

    /// Indexes each payload under the hash of its first byte, giving tests
    /// predictable fan-out.
    fn first_byte_indexer() -> Indexer {
        Box::new(|payload: &[u8]| match payload.first() {
            Some(&b) => vec![hash_of(&[b])],
            None => vec![],
        })
    }

    #[test]
    fn test_append_replay_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.log");

        let payloads: Vec<Vec<u8>> = vec![
            b"a-first".to_vec(),
            b"b-second".to_vec(),
            b"a-third".to_vec(),
        ];

        let mut log = ActionLog::open(&path, first_byte_indexer()).unwrap();
        for payload in &payloads {
            log.append(payload).unwrap();
        }
        log.close().unwrap();

        let mut log = ActionLog::open(&path, first_byte_indexer()).unwrap();
        assert_eq!(log.len(), payloads.len());
        for (sequence, payload) in payloads.iter().enumerate() {
            assert_eq!(&log.payload_at(sequence).unwrap(), payload);
        }
    }

    #[test]
    fn test_lookup_by_hash_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.log");

        let mut log = ActionLog::open(&path, first_byte_indexer()).unwrap();
        log.append(b"a-first").unwrap();
        log.append(b"b-second").unwrap();
        log.append(b"a-third").unwrap();

        let found = log.lookup_by_hash(&hash_of(b"a")).unwrap();
        assert_eq!(found, vec![b"a-first".to_vec(), b"a-third".to_vec()]);

        let found = log.lookup_by_hash(&hash_of(b"b")).unwrap();
        assert_eq!(found, vec![b"b-second".to_vec()]);

        assert!(log.lookup_by_hash(&hash_of(b"z")).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected_and_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.log");

        let mut log = ActionLog::open(&path, first_byte_indexer()).unwrap();
        log.append(b"small").unwrap();
        let len_before = std::fs::metadata(&path).unwrap().len();

        let oversized = vec![0u8; MAX_PAYLOAD + 1];
        let result = log.append(&oversized);
        assert!(matches!(result, Err(SafeError::PayloadTooLarge(65536))));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);
        assert_eq!(log.len(), 1);

        // The maximum size itself is fine.
        let max = vec![7u8; MAX_PAYLOAD];
        log.append(&max).unwrap();
        assert_eq!(log.payload_at(1).unwrap(), max);
    }

    #[test]
    fn test_truncated_trailing_frame_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.log");

        let mut log = ActionLog::open(&path, first_byte_indexer()).unwrap();
        log.append(b"a-first").unwrap();
        log.append(b"b-second").unwrap();
        log.close().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let mut log = ActionLog::open(&path, first_byte_indexer()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.payload_at(0).unwrap(), b"a-first");
        // And the index does not remember the dropped frame.
        assert!(log.lookup_by_hash(&hash_of(b"b")).unwrap().is_empty());
    }

    #[test]
    fn test_empty_payload_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.log");

        let mut log = ActionLog::open(&path, first_byte_indexer()).unwrap();
        log.append(b"").unwrap();
        log.close().unwrap();

        let mut log = ActionLog::open(&path, first_byte_indexer()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.payload_at(0).unwrap(), b"");
    }
}
