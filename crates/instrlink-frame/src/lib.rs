//! Wire codecs for instrument links.
//!
//! Two formats live here:
//! - Register-command packets: the request/response exchange that carries
//!   register access over links with no native register window (TCP, serial).
//! - Channel-tagged stream frames: the framing that lets several logical
//!   data channels share one physical DMA channel.
//!
//! Packets are decoded incrementally from a `BytesMut`, so callers never
//! deal with partial reads. Stream frames are sized from their header alone,
//! so a DMA consumer can fetch a header first and then exactly the payload.

pub mod channel;
pub mod codec;
pub mod error;
pub mod packet;
pub mod reader;
pub mod writer;

pub use channel::{DEFAULT_PHYSICAL_CHANNEL, MAX_VIRTUAL_CHANNELS};
pub use codec::{
    decode_header, encode_frame, FrameConfig, FrameHeader, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use packet::{BlockMode, RegisterCommand, Response, REG_WORD};
pub use reader::FrameReader;
pub use writer::FrameWriter;
