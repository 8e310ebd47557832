use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use instrlink_transport::LinkStream;

use crate::codec::FrameConfig;
use crate::error::{FrameError, Result};
use crate::packet::{RegisterCommand, Response};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete register packets to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and send a register request.
    pub fn send_request(&mut self, serial: u32, command: &RegisterCommand) -> Result<()> {
        self.buf.clear();
        command.encode(serial, &mut self.buf);
        self.write_buffered()
    }

    /// Encode and send a register response (device side).
    pub fn send_response(&mut self, response: &Response) -> Result<()> {
        self.buf.clear();
        response.encode(&mut self.buf);
        self.write_buffered()
    }

    /// Send bytes that are already a complete packet.
    pub fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(packet);
        self.write_buffered()
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Current writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameWriter<LinkStream> {
    /// Create a writer for a `LinkStream` and apply the write timeout from config.
    pub fn with_config_link(mut inner: LinkStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::command_id;

    #[test]
    fn writes_request_bytes() {
        let mut writer = FrameWriter::new(Vec::new());
        writer
            .send_request(0, &RegisterCommand::Read { addr: 0x10 })
            .unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[4..8], &command_id::READ.to_le_bytes());
    }

    #[test]
    fn packets_written_verbatim() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.send_packet(&[1, 2, 3]).unwrap();
        writer.send_packet(&[4]).unwrap();
        assert_eq!(writer.into_inner(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn write_zero_is_connection_closed() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut writer = FrameWriter::new(Closed);
        let err = writer
            .send_request(0, &RegisterCommand::Read { addr: 0 })
            .unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }
}
