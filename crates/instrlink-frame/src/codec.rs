use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + channel tag (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "VC" (0x56 0x43).
pub const MAGIC: [u8; 2] = [0x56, 0x43];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// The fixed part of a stream frame: which channel tag, how many bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: u16,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Header plus payload, before any padding.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload_len
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Tag      │ Payload          │
/// │ 0x56 0x43    │ (4B LE)   │ (2B LE)  │ (Length bytes)   │
/// │ "VC"         │           │          │                  │
/// └──────────────┴───────────┴──────────┴─────────────────┘
/// ```
pub fn encode_frame(tag: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u16_le(tag);
    dst.put_slice(payload);
    Ok(())
}

/// Decode the header at the start of `src`.
///
/// Returns `Ok(None)` if fewer than [`HEADER_SIZE`] bytes are available.
/// Lets a DMA consumer size the next transfer after reading only a header.
pub fn decode_header(src: &[u8], max_payload: usize) -> Result<Option<FrameHeader>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic {
            kind: "frame",
            found: u16::from_le_bytes([src[0], src[1]]) as u32,
        });
    }
    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    Ok(Some(FrameHeader {
        tag: u16::from_le_bytes([src[6], src[7]]),
        payload_len,
    }))
}

/// Configuration for the codecs.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
