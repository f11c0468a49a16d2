//! Master/worker wire protocol.
//!
//! Every message is a fixed header followed by an rkyv-serialized
//! [`Message`]:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Magic: "LMDP" (4 bytes)              │
//! │ Version: u16                         │
//! │ Flags: u16 (reserved, 0)             │
//! │ Payload length: u32 (LE)             │
//! │ Checksum: u32 (CRC32 of payload)     │
//! ├──────────────────────────────────────┤
//! │ Payload (rkyv-serialized Message)    │
//! └──────────────────────────────────────┘
//! ```
//!
//! A malformed frame is fatal to the connection it arrived on only.

use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};

/// Protocol magic bytes.
pub const MAGIC: [u8; 4] = *b"LMDP";

/// Protocol version.
pub const VERSION: u16 = 1;

/// Upper bound on a single payload.
pub const MAX_PAYLOAD: usize = 1 << 30;

pub use message::Message;

// The archived and resolver types rkyv generates carry no docs.
#[allow(missing_docs)]
mod message {
    /// Message exchanged between master and workers.
    #[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
    #[rkyv(derive(Debug))]
    pub enum Message {
        /// First message of a worker.
        Hello {
            /// Worker display name.
            name: String,
            /// Protocol version spoken by the worker.
            version: u16,
        },

        /// Master accepted the worker.
        Welcome {
            /// Identifier assigned by the master.
            worker_id: u64,
        },

        /// Master refused the worker (connections not allowed, version mismatch).
        Reject {
            /// Why.
            reason: String,
        },

        /// Shared state snapshot (a serialized root component).
        Sync {
            /// Serialized state.
            state: Vec<u8>,
        },

        /// Worker applied a [`Message::Sync`].
        SyncAck,

        /// Process `[start, end)`.
        Task {
            /// Task identifier, echoed in [`Message::TaskDone`].
            task_id: u64,
            /// First index.
            start: u64,
            /// One past the last index.
            end: u64,
        },

        /// Task finished.
        TaskDone {
            /// Task identifier.
            task_id: u64,
            /// Number of processed indices.
            processed: u64,
        },

        /// Liveness signal from a worker.
        Heartbeat,

        /// No more tasks this pass.
        Completed,

        /// Worker flushed its partial results.
        CompletedAck,

        /// Ask a worker for the serialized component at `locator`.
        GatherRequest {
            /// Locator of the result component.
            locator: String,
        },

        /// Reply to [`Message::GatherRequest`].
        GatherResult {
            /// Locator that was requested.
            locator: String,
            /// Serialized component.
            data: Vec<u8>,
        },

        /// Error report. Either side may send it before closing.
        Error {
            /// Error code.
            code: u32,
            /// Human-readable message.
            message: String,
        },

        /// Orderly shutdown.
        Shutdown,
    }
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Reject { .. } => "reject",
            Self::Sync { .. } => "sync",
            Self::SyncAck => "sync_ack",
            Self::Task { .. } => "task",
            Self::TaskDone { .. } => "task_done",
            Self::Heartbeat => "heartbeat",
            Self::Completed => "completed",
            Self::CompletedAck => "completed_ack",
            Self::GatherRequest { .. } => "gather_request",
            Self::GatherResult { .. } => "gather_result",
            Self::Error { .. } => "error",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Error codes carried by [`Message::Error`].
pub mod codes {
    /// Generic failure.
    pub const INTERNAL: u32 = 1;
    /// The task handler failed.
    pub const TASK_FAILED: u32 = 2;
    /// A locator could not be resolved.
    pub const NOT_FOUND: u32 = 3;
    /// Unexpected message.
    pub const PROTOCOL: u32 = 4;
}

/// Frame header. Serialized by hand to avoid packed-struct alignment issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    magic: [u8; 4],
    version: u16,
    flags: u16,
    payload_len: u32,
    checksum: u32,
}

impl FrameHeader {
    const SIZE: usize = 4 + 2 + 2 + 4 + 4; // 16 bytes

    fn new(payload_len: usize, checksum: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags: 0,
            payload_len: payload_len as u32,
            checksum,
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            flags: u16::from_le_bytes([bytes[6], bytes[7]]),
            payload_len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            checksum: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Protocol(format!("invalid magic: {:?}", self.magic)));
        }
        if self.version != VERSION {
            return Err(Error::Protocol(format!(
                "unsupported version: {}",
                self.version
            )));
        }
        if self.payload_len as usize > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "payload too large: {} bytes",
                self.payload_len
            )));
        }
        Ok(())
    }
}

/// CRC-32 (IEEE) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB88320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

/// Encode a message into a complete frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| Error::Protocol(format!("failed to serialize {}: {e}", msg.kind())))?;
    let header = FrameHeader::new(payload.len(), crc32(&payload));

    let mut frame = Vec::with_capacity(FrameHeader::SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame from the start of `buf`.
///
/// Returns the message and the number of bytes consumed, or `None` if `buf`
/// does not hold a complete frame yet.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>> {
    let Some(header_bytes) = buf.first_chunk::<{ FrameHeader::SIZE }>() else {
        return Ok(None);
    };
    let header = FrameHeader::from_bytes(header_bytes);
    header.validate()?;
    let total = FrameHeader::SIZE + header.payload_len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let msg = decode_payload(&header, &buf[FrameHeader::SIZE..total])?;
    Ok(Some((msg, total)))
}

fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Message> {
    let computed = crc32(payload);
    if computed != header.checksum {
        return Err(Error::Protocol(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            header.checksum, computed
        )));
    }

    // Copy to aligned buffer for rkyv
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(payload);
    rkyv::from_bytes::<Message, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Protocol(format!("malformed message: {e}")))
}

/// Write one message.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = encode(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one message. Returns `Ok(None)` when the peer closed the connection
/// cleanly between frames.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    let mut header_buf = [0u8; FrameHeader::SIZE];
    match reader.read_exact(&mut header_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let header = FrameHeader::from_bytes(&header_buf);
    header.validate()?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::ConnectionLost("connection closed mid-frame".into())
        } else {
            Error::Io(e)
        }
    })?;
    decode_payload(&header, &payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_crc32() {
        assert_eq!(crc32(b"hello"), 0x3610a686);
        assert_eq!(crc32(b""), 0x00000000);
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(100, 0x12345678);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"LMDP");
        let parsed = FrameHeader::from_bytes(&bytes);
        assert_eq!(parsed, header);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_frame_decode() {
        let msg = Message::Task {
            task_id: 7,
            start: 0,
            end: 50,
        };
        let frame = encode(&msg).unwrap();

        let (decoded, consumed) = decode(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_frame_partial() {
        let frame = encode(&Message::Heartbeat).unwrap();
        assert!(decode(&frame[..2]).unwrap().is_none());
        assert!(decode(&frame[..FrameHeader::SIZE]).unwrap().is_none());
        assert!(decode(&frame[..frame.len() - 1]).unwrap().is_none());
        assert!(decode(&frame).unwrap().is_some());
    }

    #[test]
    fn test_corrupted_payload() {
        let mut frame = encode(&Message::GatherRequest {
            locator: "$.film".into(),
        })
        .unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(decode(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_bad_magic() {
        let mut frame = encode(&Message::Shutdown).unwrap();
        frame[0] = b'X';
        assert!(matches!(decode(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_stream_io() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::Sync { state: vec![1, 2, 3] }).unwrap();
        write_message(&mut wire, &Message::SyncAck).unwrap();

        let mut reader = Cursor::new(wire);
        assert_eq!(
            read_message(&mut reader).unwrap(),
            Some(Message::Sync { state: vec![1, 2, 3] })
        );
        assert_eq!(read_message(&mut reader).unwrap(), Some(Message::SyncAck));
        assert_eq!(read_message(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_truncated_stream() {
        let frame = encode(&Message::Completed).unwrap();
        let mut reader = Cursor::new(frame[..frame.len() - 1].to_vec());
        assert!(matches!(
            read_message(&mut reader),
            Err(Error::ConnectionLost(_))
        ));
    }
}
