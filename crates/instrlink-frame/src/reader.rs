use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use instrlink_transport::LinkStream;

use crate::codec::FrameConfig;
use crate::error::{FrameError, Result};
use crate::packet::{RegisterCommand, Response};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete register packets from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete units.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the device's reply to command `expected_id` (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_response(&mut self, expected_id: u32) -> Result<Response> {
        let max = self.config.max_payload_size;
        self.read_with(|buf| Response::decode(buf, expected_id, max))
    }

    /// Read the next register request (device side, blocking).
    pub fn read_request(&mut self) -> Result<(u32, RegisterCommand)> {
        let max = self.config.max_payload_size;
        self.read_with(|buf| RegisterCommand::decode(buf, max))
    }

    /// Read exactly `len` bytes as one opaque packet (blocking).
    pub fn read_packet(&mut self, len: usize) -> Result<Bytes> {
        let max = self.config.max_payload_size;
        if len > max {
            return Err(FrameError::PayloadTooLarge { size: len, max });
        }
        self.read_with(|buf| Ok((buf.len() >= len).then(|| buf.split_to(len).freeze())))
    }

    fn read_with<R>(
        &mut self,
        mut decode: impl FnMut(&mut BytesMut) -> Result<Option<R>>,
    ) -> Result<R> {
        loop {
            if let Some(unit) = decode(&mut self.buf)? {
                return Ok(unit);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Drop any buffered bytes (after a failed exchange left the stream out of step).
    pub fn discard_buffered(&mut self) {
        self.buf.clear();
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<LinkStream> {
    /// Create a reader for a `LinkStream` and apply the read timeout from config.
    pub fn with_config_link(mut inner: LinkStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}
