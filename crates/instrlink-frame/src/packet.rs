//! Register-command packets.
//!
//! Links with no native register window carry register access as
//! request/response packets. Every field is a little-endian `u32`.
//!
//! ```text
//! request:  0x5F5F5F5F │ command id │ serial │ total len │ body...
//! response: 0xCFCFCFCF │ command id │ serial │ total len │ status │ body...
//! ```
//!
//! `total len` counts the whole packet, header included. A status of zero
//! means the device accepted the command.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Request header magic.
pub const REQUEST_MAGIC: u32 = 0x5F5F_5F5F;

/// Response header magic.
pub const RESPONSE_MAGIC: u32 = 0xCFCF_CFCF;

/// Header: magic (4) + command id (4) + serial (4) + total length (4).
pub const PACKET_HEADER_SIZE: usize = 16;

/// Width of one device register in bytes.
pub const REG_WORD: usize = 4;

/// Command identifiers.
pub mod command_id {
    pub const WRITE: u32 = 0x3100_1000;
    pub const READ: u32 = 0x3100_1001;
    pub const INCREMENT_WRITE: u32 = 0x3100_1010;
    pub const INCREMENT_READ: u32 = 0x3100_1011;
    pub const LOOP_WRITE: u32 = 0x3100_1020;
    pub const LOOP_READ: u32 = 0x3100_1021;
}

/// How a block transfer walks register addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockMode {
    /// Every word goes to (or comes from) the same register.
    Loop,
    /// Words walk consecutive registers from the base address.
    Increment,
}

impl BlockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loop => "loop",
            Self::Increment => "inc",
        }
    }
}

impl fmt::Display for BlockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockMode {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "loop" => Ok(Self::Loop),
            "inc" | "increment" => Ok(Self::Increment),
            other => Err(FrameError::Malformed(format!("unknown block mode {other:?}"))),
        }
    }
}

/// Round `len` up to a whole number of register words.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(REG_WORD) * REG_WORD
}

/// A register-level request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterCommand {
    /// Write one register word.
    Write { addr: u32, value: [u8; REG_WORD] },
    /// Read one register word.
    Read { addr: u32 },
    /// Write a run of words starting at `base`.
    BlockWrite {
        mode: BlockMode,
        base: u32,
        data: Bytes,
    },
    /// Read `length` bytes starting at `base`.
    BlockRead {
        mode: BlockMode,
        base: u32,
        length: u32,
    },
}

impl RegisterCommand {
    /// Wire command id.
    pub fn id(&self) -> u32 {
        match self {
            Self::Write { .. } => command_id::WRITE,
            Self::Read { .. } => command_id::READ,
            Self::BlockWrite {
                mode: BlockMode::Increment,
                ..
            } => command_id::INCREMENT_WRITE,
            Self::BlockWrite {
                mode: BlockMode::Loop,
                ..
            } => command_id::LOOP_WRITE,
            Self::BlockRead {
                mode: BlockMode::Increment,
                ..
            } => command_id::INCREMENT_READ,
            Self::BlockRead {
                mode: BlockMode::Loop,
                ..
            } => command_id::LOOP_READ,
        }
    }

    /// The register (or base register) this command targets.
    pub fn address(&self) -> u32 {
        match self {
            Self::Write { addr, .. } | Self::Read { addr } => *addr,
            Self::BlockWrite { base, .. } | Self::BlockRead { base, .. } => *base,
        }
    }

    /// Total encoded length in bytes.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Write { .. } => PACKET_HEADER_SIZE + 8,
            Self::Read { .. } => PACKET_HEADER_SIZE + 4,
            Self::BlockWrite { data, .. } => PACKET_HEADER_SIZE + 8 + padded_len(data.len()),
            Self::BlockRead { .. } => PACKET_HEADER_SIZE + 8,
        }
    }

    /// Encode as a request packet.
    pub fn encode(&self, serial: u32, dst: &mut BytesMut) {
        let total = self.wire_len();
        dst.reserve(total);
        dst.put_u32_le(REQUEST_MAGIC);
        dst.put_u32_le(self.id());
        dst.put_u32_le(serial);
        dst.put_u32_le(total as u32);
        match self {
            Self::Write { addr, value } => {
                dst.put_u32_le(*addr);
                dst.put_slice(value);
            }
            Self::Read { addr } => dst.put_u32_le(*addr),
            Self::BlockWrite { base, data, .. } => {
                let padded = padded_len(data.len());
                dst.put_u32_le(*base);
                dst.put_u32_le(padded as u32);
                dst.put_slice(data);
                dst.put_bytes(0, padded - data.len());
            }
            Self::BlockRead { base, length, .. } => {
                dst.put_u32_le(*base);
                dst.put_u32_le(padded_len(*length as usize) as u32);
            }
        }
    }

    /// Decode a request packet (device side).
    ///
    /// Returns the serial number and command, or `Ok(None)` if `src` does
    /// not yet hold a complete packet. Block reads decode with their padded
    /// length.
    pub fn decode(src: &mut BytesMut, max_payload: usize) -> Result<Option<(u32, Self)>> {
        let Some(header) = Header::peek(src, REQUEST_MAGIC, "request", max_payload)? else {
            return Ok(None);
        };
        if src.len() < header.total_len {
            return Ok(None);
        }

        let mut packet = src.split_to(header.total_len);
        packet.advance(PACKET_HEADER_SIZE);
        let body_len = header.total_len - PACKET_HEADER_SIZE;
        let need = |n: usize| {
            if body_len < n {
                Err(FrameError::Malformed(format!(
                    "command {:#x} body is {body_len} bytes, need {n}",
                    header.command_id
                )))
            } else {
                Ok(())
            }
        };

        let command = match header.command_id {
            command_id::WRITE => {
                need(8)?;
                let addr = packet.get_u32_le();
                let mut value = [0u8; REG_WORD];
                packet.copy_to_slice(&mut value);
                Self::Write { addr, value }
            }
            command_id::READ => {
                need(4)?;
                Self::Read {
                    addr: packet.get_u32_le(),
                }
            }
            command_id::INCREMENT_WRITE | command_id::LOOP_WRITE => {
                need(8)?;
                let base = packet.get_u32_le();
                let length = packet.get_u32_le() as usize;
                if length != body_len - 8 {
                    return Err(FrameError::Malformed(format!(
                        "block length {length} does not match body of {} bytes",
                        body_len - 8
                    )));
                }
                Self::BlockWrite {
                    mode: mode_of(header.command_id),
                    base,
                    data: packet.split_to(length).freeze(),
                }
            }
            command_id::INCREMENT_READ | command_id::LOOP_READ => {
                need(8)?;
                let base = packet.get_u32_le();
                let length = packet.get_u32_le();
                Self::BlockRead {
                    mode: mode_of(header.command_id),
                    base,
                    length,
                }
            }
            other => {
                return Err(FrameError::Malformed(format!(
                    "unknown command id {other:#x}"
                )))
            }
        };
        Ok(Some((header.serial, command)))
    }
}

fn mode_of(id: u32) -> BlockMode {
    match id {
        command_id::LOOP_WRITE | command_id::LOOP_READ => BlockMode::Loop,
        _ => BlockMode::Increment,
    }
}

struct Header {
    command_id: u32,
    serial: u32,
    total_len: usize,
}

impl Header {
    fn peek(
        src: &[u8],
        magic: u32,
        kind: &'static str,
        max_payload: usize,
    ) -> Result<Option<Self>> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }
        let word = |i: usize| u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
        let found = word(0);
        if found != magic {
            return Err(FrameError::InvalidMagic { kind, found });
        }
        let total_len = word(12) as usize;
        if total_len < PACKET_HEADER_SIZE {
            return Err(FrameError::Malformed(format!(
                "{kind} length {total_len} is shorter than its header"
            )));
        }
        if total_len - PACKET_HEADER_SIZE > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: total_len - PACKET_HEADER_SIZE,
                max: max_payload,
            });
        }
        Ok(Some(Self {
            command_id: word(4),
            serial: word(8),
            total_len,
        }))
    }
}

/// A device reply to a [`RegisterCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Id of the command being answered.
    pub command_id: u32,
    /// Serial number echoed from the request.
    pub serial: u32,
    /// Zero on success, device-defined otherwise.
    pub status: u32,
    /// Data following the status word (read results).
    pub body: Bytes,
}

impl Response {
    /// A successful reply carrying `body`.
    pub fn ok(command_id: u32, serial: u32, body: impl Into<Bytes>) -> Self {
        Self {
            command_id,
            serial,
            status: 0,
            body: body.into(),
        }
    }

    /// A reply refusing the command with a non-zero status.
    pub fn rejected(command_id: u32, serial: u32, status: u32) -> Self {
        Self {
            command_id,
            serial,
            status,
            body: Bytes::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    /// Encode as a response packet (device side).
    pub fn encode(&self, dst: &mut BytesMut) {
        let total = PACKET_HEADER_SIZE + 4 + self.body.len();
        dst.reserve(total);
        dst.put_u32_le(RESPONSE_MAGIC);
        dst.put_u32_le(self.command_id);
        dst.put_u32_le(self.serial);
        dst.put_u32_le(total as u32);
        dst.put_u32_le(self.status);
        dst.put_slice(&self.body);
    }

    /// Decode the reply to command `expected_id`.
    ///
    /// Returns `Ok(None)` if `src` does not yet hold a complete packet. A
    /// reply to any other command id is an error: the exchange is out of
    /// step and the link cannot be trusted.
    pub fn decode(src: &mut BytesMut, expected_id: u32, max_payload: usize) -> Result<Option<Self>> {
        let Some(header) = Header::peek(src, RESPONSE_MAGIC, "response", max_payload)? else {
            return Ok(None);
        };
        if header.command_id != expected_id {
            return Err(FrameError::UnexpectedResponse {
                expected: expected_id,
                found: header.command_id,
            });
        }
        if header.total_len < PACKET_HEADER_SIZE + 4 {
            return Err(FrameError::Malformed(format!(
                "response length {} leaves no room for a status word",
                header.total_len
            )));
        }
        if src.len() < header.total_len {
            return Ok(None);
        }

        let mut packet = src.split_to(header.total_len);
        packet.advance(PACKET_HEADER_SIZE);
        let status = packet.get_u32_le();
        Ok(Some(Self {
            command_id: header.command_id,
            serial: header.serial,
            status,
            body: packet.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_PAYLOAD;

    #[test]
    fn test_write_request_layout() {
        let mut buf = BytesMut::new();
        RegisterCommand::Write {
            addr: 0x10,
            value: 5u32.to_le_bytes(),
        }
        .encode(0, &mut buf);

        let words: Vec<u32> = buf
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![REQUEST_MAGIC, command_id::WRITE, 0, 24, 0x10, 5]);
    }

    #[test]
    fn test_read_request_layout() {
        let mut buf = BytesMut::new();
        RegisterCommand::Read { addr: 0x20 }.encode(7, &mut buf);
        assert_eq!(buf.len(), 20);
        assert_eq!(&buf[4..8], &command_id::READ.to_le_bytes());
        assert_eq!(&buf[8..12], &7u32.to_le_bytes());
    }

    #[test]
    fn test_block_write_is_padded() {
        let cmd = RegisterCommand::BlockWrite {
            mode: BlockMode::Increment,
            base: 0x100,
            data: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        let mut buf = BytesMut::new();
        cmd.encode(0, &mut buf);
        assert_eq!(buf.len(), 24 + 8);
        assert_eq!(&buf[12..16], &32u32.to_le_bytes());
        assert_eq!(&buf[20..24], &8u32.to_le_bytes());
        assert_eq!(&buf[24..], &[1, 2, 3, 4, 5, 0, 0, 0]);

        let (_, decoded) = RegisterCommand::decode(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(
            decoded,
            RegisterCommand::BlockWrite {
                mode: BlockMode::Increment,
                base: 0x100,
                data: Bytes::from_static(&[1, 2, 3, 4, 5, 0, 0, 0]),
            }
        );
    }

    #[test]
    fn test_loop_ids() {
        let read = RegisterCommand::BlockRead {
            mode: BlockMode::Loop,
            base: 0,
            length: 3,
        };
        assert_eq!(read.id(), command_id::LOOP_READ);
        let mut buf = BytesMut::new();
        read.encode(0, &mut buf);
        assert_eq!(&buf[20..24], &4u32.to_le_bytes(), "length is padded to a word");
    }

    #[test]
    fn test_response_decode_waits_for_body() {
        let mut wire = BytesMut::new();
        Response::ok(command_id::READ, 0, Bytes::from_static(&[9, 0, 0, 0])).encode(&mut wire);
        assert_eq!(wire.len(), 24);

        let mut partial = BytesMut::from(&wire[..18]);
        assert!(Response::decode(&mut partial, command_id::READ, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .is_none());

        let resp = Response::decode(&mut wire, command_id::READ, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.body.as_ref(), &[9, 0, 0, 0]);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_response_for_other_command_rejected() {
        let mut wire = BytesMut::new();
        Response::ok(command_id::WRITE, 0, Bytes::new()).encode(&mut wire);
        let err = Response::decode(&mut wire, command_id::READ, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(
            err,
            FrameError::UnexpectedResponse {
                expected: command_id::READ,
                found: command_id::WRITE
            }
        ));
    }

    #[test]
    fn test_response_bad_magic() {
        let mut wire = BytesMut::new();
        RegisterCommand::Read { addr: 0 }.encode(0, &mut wire);
        let err = Response::decode(&mut wire, command_id::READ, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMagic { kind: "response", .. }));
    }

    #[test]
    fn test_rejected_status() {
        let mut wire = BytesMut::new();
        Response::rejected(command_id::WRITE, 0, 3).encode(&mut wire);
        let resp = Response::decode(&mut wire, command_id::WRITE, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.status, 3);
    }

    #[test]
    fn test_unknown_request_id() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(REQUEST_MAGIC);
        wire.put_u32_le(0x1234);
        wire.put_u32_le(0);
        wire.put_u32_le(16);
        let err = RegisterCommand::decode(&mut wire, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_block_mode_parse() {
        assert_eq!("loop".parse::<BlockMode>().unwrap(), BlockMode::Loop);
        assert_eq!("inc".parse::<BlockMode>().unwrap(), BlockMode::Increment);
        assert!("stride".parse::<BlockMode>().is_err());
    }
}
