//! Frame layout for replication sessions.
//!
//! Every message travels in one frame with a fixed 14-byte header
//! (magic:4 + version:1 + tag:1 + payload_length:4 + checksum:4, big-endian)
//! followed by the payload. The tag is the message type; the transport does
//! not interpret it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 14;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0xD5A1_0001;

/// Frame format version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Frame header containing metadata about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Frame format version
    pub version: u8,
    /// One-byte message type tag
    pub tag: u8,
    /// Payload length in bytes
    pub payload_length: u32,
    /// CRC32 checksum of payload
    pub checksum: u32,
}

impl FrameHeader {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.tag);
        buf.put_u32(self.payload_length);
        buf.put_u32(self.checksum);
    }

    /// Decodes and checks a header read off the wire.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("short header: {} bytes", buf.len()),
            });
        }
        let header = Self {
            magic: buf.get_u32(),
            version: buf.get_u8(),
            tag: buf.get_u8(),
            payload_length: buf.get_u32(),
            checksum: buf.get_u32(),
        };
        if header.magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: header.magic,
            });
        }
        if header.version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: header.version,
            });
        }
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(header)
    }
}

/// A single frame on a replication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame carrying `payload` under message type `tag`.
    pub fn new(tag: u8, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            tag,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Message type tag.
    pub fn tag(&self) -> u8 {
        self.header.tag
    }

    /// Serializes header and payload into one buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes one complete frame from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = FrameHeader::decode(buf)?;
        let body = &buf[FRAME_HEADER_SIZE..];
        if body.len() != header.payload_length as usize {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "payload length {} does not match header {}",
                    body.len(),
                    header.payload_length
                ),
            });
        }
        let frame = Self {
            header,
            payload: body.to_vec(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Verifies the payload checksum.
    pub fn validate(&self) -> Result<()> {
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let frame = Frame::new(0x10, b"update".to_vec());
        let bytes = frame.encode();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 6);
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.tag(), 0x10);
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(0x30, Vec::new());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let frame = Frame::new(0x10, b"payload".to_vec());
        let mut bytes = frame.encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Frame::new(1, vec![]).encode().to_vec();
        bytes[0] = 0;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(TransportError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            tag: 1,
            payload_length: MAX_PAYLOAD_SIZE + 1,
            checksum: 0,
        }
        .encode_into(&mut buf);
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_short_header() {
        assert!(FrameHeader::decode(&[0u8; 4]).is_err());
    }
}
