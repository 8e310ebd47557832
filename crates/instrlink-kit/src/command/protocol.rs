//! Register-command packet exchange shared by the byte-link transports.

use std::fmt;
use std::io::ErrorKind;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use instrlink_frame::{
    BlockMode, FrameConfig, FrameError, FrameReader, FrameWriter, RegisterCommand, Response,
    Result as FrameResult, REG_WORD,
};
use instrlink_transport::{LinkStream, TransportError};
use tracing::{debug, warn};

use crate::error::{KitError, Result};

/// Serial number stamped on every request.
const REQUEST_SERIAL: u32 = 0;

struct Session {
    reader: FrameReader<LinkStream>,
    writer: FrameWriter<LinkStream>,
}

/// Request/response register access over one byte link.
///
/// TCP and serial command interfaces hold one of these. Exchanges are
/// serialized: a request and its response never interleave with another
/// caller's.
#[derive(Default)]
pub struct RegisterProtocol {
    session: Mutex<Option<Session>>,
}

impl RegisterProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start exchanging packets over `link`, replacing any previous link.
    pub fn attach(&self, link: LinkStream, config: FrameConfig) -> Result<()> {
        let writer_link = link.try_clone()?;
        let reader = FrameReader::with_config_link(link, config.clone())?;
        let writer = FrameWriter::with_config_link(writer_link, config)?;
        if let Some(old) = self.lock().replace(Session { reader, writer }) {
            let _ = old.reader.get_ref().shutdown();
        }
        Ok(())
    }

    /// Drop the link. A no-op when nothing is attached.
    pub fn detach(&self) {
        if let Some(session) = self.lock().take() {
            if let Err(err) = session.reader.get_ref().shutdown() {
                debug!(%err, "link shutdown failed");
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Run one exchange on the session, dropping it when the link is lost.
    fn run<R>(
        &self,
        what: fmt::Arguments<'_>,
        exchange: impl FnOnce(&mut Session) -> FrameResult<R>,
    ) -> Result<R> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(TransportError::Shutdown)?;

        match exchange(session) {
            Ok(reply) => Ok(reply),
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                // A late reply would be taken for the next command's.
                session.reader.discard_buffered();
                warn!(exchange = %what, "device did not answer in time");
                Err(KitError::Transport(TransportError::Io(err)))
            }
            Err(err @ (FrameError::ConnectionClosed | FrameError::Io(_) | FrameError::Transport(_))) => {
                warn!(%err, exchange = %what, "link lost during exchange");
                *guard = None;
                Err(err.into())
            }
            Err(err) => {
                session.reader.discard_buffered();
                Err(err.into())
            }
        }
    }

    /// Send one command and return the device's accepted reply.
    pub fn exchange(&self, command: &RegisterCommand) -> Result<Response> {
        let response = self.run(format_args!("register {:#x}", command.address()), |session| {
            session.writer.send_request(REQUEST_SERIAL, command)?;
            session.reader.read_response(command.id())
        })?;

        if !response.is_ok() {
            return Err(TransportError::DeviceStatus {
                address: command.address(),
                status: response.status,
            }
            .into());
        }
        debug!(
            command = format_args!("{:#x}", command.id()),
            address = format_args!("{:#x}", command.address()),
            "register exchange complete"
        );
        Ok(response)
    }

    /// Send a complete packet and read back exactly `response_len` bytes.
    pub fn exchange_packet(&self, packet: &[u8], response_len: usize) -> Result<Bytes> {
        let response = self.run(format_args!("command packet"), |session| {
            session.writer.send_packet(packet)?;
            session.reader.read_packet(response_len)
        })?;
        debug!(sent = packet.len(), received = response.len(), "command packet exchange complete");
        Ok(response)
    }

    /// Write one word. Returns the confirmation body.
    pub fn write(&self, addr: u32, value: [u8; REG_WORD]) -> Result<Bytes> {
        let response = self.exchange(&RegisterCommand::Write { addr, value })?;
        Ok(response.body)
    }

    /// Read one word.
    pub fn read(&self, addr: u32) -> Result<Bytes> {
        let response = self.exchange(&RegisterCommand::Read { addr })?;
        if response.body.len() < REG_WORD {
            return Err(TransportError::Protocol(format!(
                "read reply at {addr:#x} carries {} bytes",
                response.body.len()
            ))
            .into());
        }
        Ok(response.body.slice(..REG_WORD))
    }

    pub fn block_write(&self, base: u32, data: &[u8], mode: BlockMode) -> Result<()> {
        self.exchange(&RegisterCommand::BlockWrite {
            mode,
            base,
            data: Bytes::copy_from_slice(data),
        })?;
        Ok(())
    }

    pub fn block_read(&self, base: u32, length: usize, mode: BlockMode) -> Result<Bytes> {
        let wire_length = u32::try_from(length.div_ceil(REG_WORD) * REG_WORD)
            .map_err(|_| KitError::Validation(format!("block length {length} is too long")))?;
        let response = self.exchange(&RegisterCommand::BlockRead {
            mode,
            base,
            length: wire_length,
        })?;
        if response.body.len() < length {
            return Err(TransportError::Protocol(format!(
                "block read at {base:#x} returned {} of {length} bytes",
                response.body.len()
            ))
            .into());
        }
        Ok(response.body.slice(..length))
    }
}

/// Serve register requests against a word map until the link closes.
///
/// Runs the device side of the exchange; used by tests and the loopback
/// examples.
#[cfg(test)]
pub(crate) fn serve_registers<T: std::io::Read + std::io::Write>(
    reader: T,
    writer: T,
    reject: Option<u32>,
) {
    use std::collections::HashMap;

    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);
    let mut words: HashMap<u32, u32> = HashMap::new();
    while let Ok((serial, command)) = reader.read_request() {
        let id = command.id();
        if Some(command.address()) == reject {
            writer
                .send_response(&Response::rejected(id, serial, 0x5))
                .unwrap();
            continue;
        }
        let body = match command {
            RegisterCommand::Write { addr, value } => {
                words.insert(addr, u32::from_le_bytes(value));
                Bytes::new()
            }
            RegisterCommand::Read { addr } => {
                Bytes::copy_from_slice(&words.get(&addr).copied().unwrap_or(0).to_le_bytes())
            }
            RegisterCommand::BlockWrite { mode, base, data } => {
                for (i, chunk) in data.chunks(REG_WORD).enumerate() {
                    let addr = match mode {
                        BlockMode::Loop => base,
                        BlockMode::Increment => base + (i * REG_WORD) as u32,
                    };
                    let mut word = [0u8; REG_WORD];
                    word[..chunk.len()].copy_from_slice(chunk);
                    words.insert(addr, u32::from_le_bytes(word));
                }
                Bytes::new()
            }
            RegisterCommand::BlockRead { mode, base, length } => {
                let mut out = Vec::new();
                for i in 0..(length as usize / REG_WORD) {
                    let addr = match mode {
                        BlockMode::Loop => base,
                        BlockMode::Increment => base + (i * REG_WORD) as u32,
                    };
                    out.extend_from_slice(&words.get(&addr).copied().unwrap_or(0).to_le_bytes());
                }
                Bytes::from(out)
            }
        };
        writer.send_response(&Response::ok(id, serial, body)).unwrap();
    }
}
