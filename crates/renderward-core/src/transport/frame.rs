//! Pipe frame codec
//!
//! ```text
//! +-----------+----------+----------------+-------------+-------------+----------------+---------+
//! | magic (4) | kind (4) | message id (8) | length (4)  | crc32 (4)   | timestamp (8)  | payload |
//! +-----------+----------+----------------+-------------+-------------+----------------+---------+
//! ```
//!
//! All integers are little-endian. The length covers the payload only and is
//! checked against the connection's limit before anything is buffered for it.

use crate::protocol::now_millis;
use crate::{RenderwardError, Result};

/// "REND"
pub const FRAME_MAGIC: u32 = 0x5245_4E44;

pub const HEADER_SIZE: usize = 32;

const MIN_BUFFER_CAPACITY: usize = 4096;

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    Command = 1,
    Result = 2,
    Heartbeat = 3,
    /// Generic manager message
    Message = 4,
}

impl TryFrom<u32> for FrameKind {
    type Error = RenderwardError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Command),
            2 => Ok(Self::Result),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::Message),
            other => Err(RenderwardError::Protocol(format!("unknown frame kind {other}"))),
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub message_id: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

/// Build a frame, refusing payloads over `max_payload`
pub fn encode(kind: FrameKind, message_id: u64, payload: &[u8], max_payload: usize) -> Result<Vec<u8>> {
    if payload.len() > max_payload {
        return Err(RenderwardError::MessageTooLarge {
            size: payload.len(),
            max: max_payload,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| RenderwardError::MessageTooLarge {
        size: payload.len(),
        max: max_payload,
    })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(kind as u32).to_le_bytes());
    buf.extend_from_slice(&message_id.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(&now_millis().to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Streaming decoder: buffers bytes and yields whole frames
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
    max_payload: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_payload,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed
    ///
    /// Any error means the stream can no longer be trusted and the
    /// connection should be dropped.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.available() < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let magic = read_u32(header, 0);
        if magic != FRAME_MAGIC {
            return Err(RenderwardError::Protocol(format!("bad frame magic {magic:#010x}")));
        }
        let kind = FrameKind::try_from(read_u32(header, 4))?;
        let message_id = read_u64(header, 8);
        let len = read_u32(header, 16) as usize;
        let checksum = read_u32(header, 20);
        let timestamp = read_u64(header, 24);

        if len > self.max_payload {
            return Err(RenderwardError::MessageTooLarge {
                size: len,
                max: self.max_payload,
            });
        }
        if self.available() < HEADER_SIZE + len {
            return Ok(None);
        }

        let start = self.read_pos + HEADER_SIZE;
        let payload = &self.buffer[start..start + len];
        let actual = crc32fast::hash(payload);
        if actual != checksum {
            return Err(RenderwardError::Protocol(format!(
                "checksum mismatch: expected {checksum:#010x}, got {actual:#010x}"
            )));
        }

        let frame = Frame {
            kind,
            message_id,
            timestamp,
            payload: payload.to_vec(),
        };
        self.read_pos = start + len;
        Ok(Some(frame))
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_pushes() {
        let a = encode(FrameKind::Command, 1, b"first", 1024).unwrap();
        let b = encode(FrameKind::Result, 2, b"second payload", 1024).unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new(1024);
        for chunk in stream.chunks(7) {
            decoder.push(chunk);
        }

        let first = decoder.decode().unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Command);
        assert_eq!(first.message_id, 1);
        assert_eq!(first.payload, b"first");

        let second = decoder.decode().unwrap().unwrap();
        assert_eq!(second.kind, FrameKind::Result);
        assert_eq!(second.payload, b"second payload");

        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn partial_header_waits_for_more() {
        let frame = encode(FrameKind::Heartbeat, 0, &[], 16).unwrap();
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&frame[..HEADER_SIZE - 1]);
        assert!(decoder.decode().unwrap().is_none());
        decoder.push(&frame[HEADER_SIZE - 1..]);
        assert_eq!(decoder.decode().unwrap().unwrap().kind, FrameKind::Heartbeat);
    }

    #[test]
    fn oversized_payload_is_refused_on_encode() {
        let err = encode(FrameKind::Message, 9, &[0u8; 65], 64).unwrap_err();
        assert!(matches!(err, RenderwardError::MessageTooLarge { size: 65, max: 64 }));
    }

    #[test]
    fn oversized_length_is_refused_before_buffering_payload() {
        let frame = encode(FrameKind::Message, 9, &[7u8; 100], 1000).unwrap();
        let mut decoder = FrameDecoder::new(50);
        decoder.push(&frame[..HEADER_SIZE]);
        assert!(matches!(
            decoder.decode(),
            Err(RenderwardError::MessageTooLarge { size: 100, max: 50 })
        ));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut frame = encode(FrameKind::Result, 3, b"payload", 64).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&frame);
        assert!(matches!(decoder.decode(), Err(RenderwardError::Protocol(_))));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut frame = encode(FrameKind::Result, 3, b"x", 64).unwrap();
        frame[0] = 0;
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&frame);
        assert!(matches!(decoder.decode(), Err(RenderwardError::Protocol(_))));
    }
}
