//! Checksummed frame log.
//!
//! Each frame on disk is laid out as:
//!
//! ```text
//! | magic (4) | len (4, LE) | data (len) | crc32(data) (4, LE) |
//! ```
//!
//! On open the log is scanned once to index frame positions. A partially
//! written tail (short header, short body, or unrecognised magic) is cut off,
//! since it can only come from a crash mid-append. A frame whose checksum
//! does not match is kept in the index and reported as
//! [`StorageError::CorruptFrame`] when read, so callers can skip it and keep
//! going.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use tracing::warn;

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DSF1";

/// Size of the frame header (magic + length).
pub const FRAME_HEADER_SIZE: usize = 8;

const CRC_SIZE: usize = 4;

/// Location of one frame inside the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameRef {
    offset: u64,
    len: u32,
}

impl FrameRef {
    fn total_len(self) -> u64 {
        (FRAME_HEADER_SIZE + self.len as usize + CRC_SIZE) as u64
    }
}

/// One frame read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame header.
    pub offset: u64,
    /// Frame contents.
    pub data: Vec<u8>,
}

/// An append-only sequence of checksummed frames over a [`StorageBackend`].
pub struct FrameLog<B: StorageBackend> {
    backend: B,
    frames: Vec<FrameRef>,
}

impl<B: StorageBackend> FrameLog<B> {
    /// Opens a frame log, indexing existing frames and dropping a torn tail.
    pub fn open(mut backend: B) -> StorageResult<Self> {
        let size = backend.size()?;
        let mut frames = Vec::new();
        let mut offset = 0u64;

        while size - offset >= FRAME_HEADER_SIZE as u64 {
            let header = backend.read_at(offset, FRAME_HEADER_SIZE)?;
            if header[..4] != FRAME_MAGIC {
                break;
            }
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let frame = FrameRef { offset, len };
            if offset + frame.total_len() > size {
                break;
            }
            frames.push(frame);
            offset += frame.total_len();
        }

        if offset < size {
            warn!(
                valid_bytes = offset,
                dropped_bytes = size - offset,
                "truncating torn tail of frame log"
            );
            backend.truncate(offset)?;
        }

        Ok(Self { backend, frames })
    }

    /// Appends a frame. The frame is durable only after [`Self::sync`].
    ///
    /// Returns the index of the new frame.
    pub fn append(&mut self, data: &[u8]) -> StorageResult<usize> {
        let len = u32::try_from(data.len()).map_err(|_| StorageError::FrameTooLarge(data.len()))?;

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + data.len() + CRC_SIZE);
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&compute_crc32(data).to_le_bytes());

        let offset = self.backend.append(&buf)?;
        self.frames.push(FrameRef { offset, len });
        Ok(self.frames.len() - 1)
    }

    /// Makes all appended frames durable.
    pub fn sync(&mut self) -> StorageResult<()> {
        self.backend.sync()
    }

    /// Reads and verifies the frame at `index`.
    pub fn read(&self, index: usize) -> StorageResult<Frame> {
        let frame = self.frames.get(index).copied().ok_or(StorageError::ReadPastEnd {
            offset: index as u64,
            len: 0,
            size: self.frames.len() as u64,
        })?;

        let bytes = self
            .backend
            .read_at(frame.offset, frame.total_len() as usize)?;
        let body_end = FRAME_HEADER_SIZE + frame.len as usize;
        let data = &bytes[FRAME_HEADER_SIZE..body_end];
        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);

        if compute_crc32(data) != stored {
            return Err(StorageError::corrupt(frame.offset, "checksum mismatch"));
        }

        Ok(Frame {
            offset: frame.offset,
            data: data.to_vec(),
        })
    }

    /// Iterates over all frames in append order.
    ///
    /// Frames are read lazily; a corrupt frame yields an error and iteration
    /// continues with the next one.
    pub fn iter(&self) -> impl Iterator<Item = StorageResult<Frame>> + '_ {
        (0..self.frames.len()).map(move |i| self.read(i))
    }

    /// Removes every frame.
    pub fn reset(&mut self) -> StorageResult<()> {
        self.backend.truncate(0)?;
        self.backend.sync()?;
        self.frames.clear();
        Ok(())
    }

    /// Returns the number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the log holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileBackend, InMemoryBackend};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn collect(log: &FrameLog<InMemoryBackend>) -> Vec<Vec<u8>> {
        log.iter().map(|f| f.unwrap().data).collect()
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn append_and_iterate() {
        let mut log = FrameLog::open(InMemoryBackend::new()).unwrap();
        assert!(log.is_empty());

        assert_eq!(log.append(b"one").unwrap(), 0);
        assert_eq!(log.append(b"").unwrap(), 1);
        assert_eq!(log.append(b"three").unwrap(), 2);

        assert_eq!(log.len(), 3);
        assert_eq!(collect(&log), vec![b"one".to_vec(), vec![], b"three".to_vec()]);
    }

    #[test]
    fn reopen_indexes_existing_frames() {
        let mut log = FrameLog::open(InMemoryBackend::new()).unwrap();
        log.append(b"alpha").unwrap();
        log.append(b"beta").unwrap();
        let bytes = log.backend().data();

        let reopened = FrameLog::open(InMemoryBackend::with_data(bytes)).unwrap();
        assert_eq!(collect(&reopened), vec![b"alpha".to_vec(), b"beta".to_vec()]);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let mut log = FrameLog::open(InMemoryBackend::new()).unwrap();
        log.append(b"complete").unwrap();
        log.append(b"will be torn").unwrap();
        let mut bytes = log.backend().data();
        bytes.truncate(bytes.len() - 3);
        let good_len = (FRAME_HEADER_SIZE + 8 + 4) as u64;

        let reopened = FrameLog::open(InMemoryBackend::with_data(bytes)).unwrap();
        assert_eq!(collect(&reopened), vec![b"complete".to_vec()]);
        assert_eq!(reopened.backend().size().unwrap(), good_len);
    }

    #[test]
    fn corrupt_frame_is_reported_and_skipped() {
        let mut log = FrameLog::open(InMemoryBackend::new()).unwrap();
        log.append(b"first").unwrap();
        log.append(b"second").unwrap();
        log.append(b"third").unwrap();
        let mut bytes = log.backend().data();

        // Flip one byte inside the body of the second frame.
        let second_body = FRAME_HEADER_SIZE + 5 + 4 + FRAME_HEADER_SIZE;
        bytes[second_body] ^= 0xFF;

        let reopened = FrameLog::open(InMemoryBackend::with_data(bytes)).unwrap();
        let results: Vec<_> = reopened.iter().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StorageError::CorruptFrame { .. })));
        assert_eq!(results[2].as_ref().unwrap().data, b"third");
    }

    #[test]
    fn reset_empties_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames.log");

        let mut log = FrameLog::open(FileBackend::open(&path).unwrap()).unwrap();
        log.append(b"data").unwrap();
        log.sync().unwrap();
        log.reset().unwrap();
        assert!(log.is_empty());
        drop(log);

        let reopened = FrameLog::open(FileBackend::open(&path).unwrap()).unwrap();
        assert!(reopened.is_empty());
    }

    proptest! {
        #[test]
        fn frames_survive_reopen(payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 0..16)) {
            let mut log = FrameLog::open(InMemoryBackend::new()).unwrap();
            for p in &payloads {
                log.append(p).unwrap();
            }
            let reopened = FrameLog::open(InMemoryBackend::with_data(log.backend().data())).unwrap();
            prop_assert_eq!(collect(&reopened), payloads);
        }
    }
}
