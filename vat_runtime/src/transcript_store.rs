//! Append-only delivery transcript: binary protobuf log.
//!
//! Storage format: length-prefixed protobuf frames.
//!   [4-byte LE length][frame bytes][4-byte LE length][frame bytes]...
//!
//! Rules:
//!   - Strict append only: no mutation, no deletion, no reordering
//!   - fsync after every write
//!   - Sequence strictly increasing from 1 (validated on append)
//!   - A zero, oversized or truncated frame fails the whole load

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use prost::Message;
use tracing::debug;
use vat_core::Delivery;

use crate::error::{Result, RuntimeError};
use crate::proto_bridge::{delivery_to_proto, proto_to_delivery};
use crate::proto_types::ProtoDeliveryFrame;

/// Largest frame accepted on load.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Append-only transcript backed by a binary file.
pub struct TranscriptStore {
    path: PathBuf,
    last_sequence: u64,
}

impl TranscriptStore {
    /// Open or create a transcript at the given path. Existing frames are
    /// read to find the last sequence number.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let last_sequence = if path.exists() {
            Self::read_all_from_file(path)?.last().map_or(0, |f| f.sequence)
        } else {
            0
        };
        Ok(Self { path: path.to_path_buf(), last_sequence })
    }

    /// Append one frame. Its sequence must be exactly one past the last.
    pub fn append_frame(&mut self, frame: &ProtoDeliveryFrame) -> Result<()> {
        let expected = self.last_sequence + 1;
        if frame.sequence != expected {
            return Err(RuntimeError::SequenceViolation { expected, got: frame.sequence });
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let buf = frame.encode_to_vec();
        let len = buf.len() as u32;
        {
            let mut writer = BufWriter::new(&mut file);
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&buf)?;
            writer.flush()?;
        }
        file.sync_all()?;

        debug!(sequence = frame.sequence, bytes = buf.len(), "transcript append");
        self.last_sequence = frame.sequence;
        Ok(())
    }

    /// Append a delivery under the next sequence number and return it.
    pub fn append(&mut self, delivery: &Delivery) -> Result<u64> {
        let sequence = self.last_sequence + 1;
        self.append_frame(&delivery_to_proto(sequence, delivery))?;
        Ok(sequence)
    }

    pub fn load_all_frames(&self) -> Result<Vec<ProtoDeliveryFrame>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Self::read_all_from_file(&self.path)
    }

    /// Every delivery in sequence order.
    pub fn load_deliveries(&self) -> Result<Vec<Delivery>> {
        self.load_all_frames()?.iter().map(proto_to_delivery).collect()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all_from_file(path: &Path) -> Result<Vec<ProtoDeliveryFrame>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut frames: Vec<ProtoDeliveryFrame> = Vec::new();
        let mut len_buf = [0u8; 4];

        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len == 0 || len > MAX_FRAME_LEN {
                return Err(RuntimeError::Decode(format!("invalid frame length: {len}")));
            }

            let mut buf = vec![0u8; len];
            reader
                .read_exact(&mut buf)
                .map_err(|e| RuntimeError::Decode(format!("truncated frame: {e}")))?;
            let frame = ProtoDeliveryFrame::decode(buf.as_slice())?;

            let expected = frames.last().map_or(1, |f| f.sequence + 1);
            if frame.sequence != expected {
                return Err(RuntimeError::SequenceViolation { expected, got: frame.sequence });
            }
            frames.push(frame);
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vat_core::{CapData, VatRef};

    fn delivery(method: &str) -> Delivery {
        Delivery::Message {
            target: VatRef::root(),
            method: method.into(),
            args: CapData::new("[]", vec![]),
            result: None,
        }
    }

    #[test]
    fn appends_are_numbered_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t").join("transcript.log");
        let mut store = TranscriptStore::open(&path).unwrap();
        assert_eq!(store.append(&delivery("a")).unwrap(), 1);
        assert_eq!(store.append(&delivery("b")).unwrap(), 2);

        let reopened = TranscriptStore::open(&path).unwrap();
        assert_eq!(reopened.last_sequence(), 2);
        assert_eq!(reopened.load_deliveries().unwrap(), vec![delivery("a"), delivery("b")]);
    }

    #[test]
    fn out_of_order_frames_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TranscriptStore::open(&dir.path().join("t.log")).unwrap();
        let err = store.append_frame(&delivery_to_proto(3, &delivery("a"))).unwrap_err();
        assert!(matches!(err, RuntimeError::SequenceViolation { expected: 1, got: 3 }));
        assert_eq!(store.last_sequence(), 0);
    }

    #[test]
    fn truncated_tail_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        let mut store = TranscriptStore::open(&path).unwrap();
        store.append(&delivery("a")).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&40u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        assert!(matches!(TranscriptStore::open(&path), Err(RuntimeError::Decode(_))));
    }
}
