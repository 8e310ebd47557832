use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use instrlink_frame::packet::{PACKET_HEADER_SIZE, RESPONSE_MAGIC};
use instrlink_frame::REG_WORD;
use instrlink_transport::{Target, TransportError};
use tracing::debug;

use super::{validate_access, CommandInterface};
use crate::error::{KitError, Result};

/// Status word the simulated device answers with at a faulting address.
pub const SIM_FAULT_STATUS: u32 = 0xDEAD;

/// Builds the simulated device's reply to a command packet.
pub type Responder = Box<dyn Fn(&[u8], usize) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct SimDevice {
    name: Option<String>,
    registers: HashMap<u32, u32>,
    faults: HashSet<u32>,
    operations: u64,
    last_packet: Option<Bytes>,
}

/// In-memory register file behind a `sim://` target.
///
/// Unwritten registers read as zero. Addresses marked with
/// [`SimCommand::fail_address`] reject every access, the way a device
/// refuses an unmapped register. Command packets are acknowledged with a
/// response header that echoes the request's id and serial, followed by
/// zeros, unless a [`Responder`] is installed.
pub struct SimCommand {
    device: Mutex<SimDevice>,
    address_limit: Option<u32>,
    responder: Option<Responder>,
}

impl Default for SimCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCommand {
    pub fn new() -> Self {
        Self {
            device: Mutex::new(SimDevice::default()),
            address_limit: None,
            responder: None,
        }
    }

    pub fn with_address_limit(mut self, limit: u32) -> Self {
        self.address_limit = Some(limit);
        self
    }

    /// Answer command packets with `responder` instead of the default
    /// acknowledgement.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&[u8], usize) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// The most recent command packet received.
    pub fn last_packet(&self) -> Option<Bytes> {
        self.lock().last_packet.clone()
    }

    /// Set a register without going through the command path.
    pub fn poke(&self, addr: u32, value: u32) {
        self.lock().registers.insert(addr, value);
    }

    /// Current register value.
    pub fn peek(&self, addr: u32) -> u32 {
        self.lock().registers.get(&addr).copied().unwrap_or(0)
    }

    /// Make every access to `addr` fail with a device rejection.
    pub fn fail_address(&self, addr: u32) {
        self.lock().faults.insert(addr);
    }

    /// Number of register operations that reached the device.
    pub fn operations(&self) -> u64 {
        self.lock().operations
    }

    fn lock(&self) -> MutexGuard<'_, SimDevice> {
        self.device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn access(&self, addr: u32) -> Result<MutexGuard<'_, SimDevice>> {
        let mut device = self.lock();
        if device.name.is_none() {
            return Err(TransportError::Shutdown.into());
        }
        device.operations += 1;
        if device.faults.contains(&addr) {
            return Err(TransportError::DeviceStatus {
                address: addr,
                status: SIM_FAULT_STATUS,
            }
            .into());
        }
        Ok(device)
    }
}

impl CommandInterface for SimCommand {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn open(&self, target: &Target) -> Result<()> {
        let Target::Sim { name } = target else {
            return Err(KitError::Config(format!(
                "sim command interface cannot open {target}"
            )));
        };
        self.lock().name = Some(name.clone());
        debug!(%target, "sim command interface opened");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.lock().name = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().name.is_some()
    }

    fn address_limit(&self) -> Option<u32> {
        self.address_limit
    }

    fn write(&self, addr: u32, value: &[u8]) -> Result<Bytes> {
        let word = validate_access(self, addr, Some(value))?;
        let mut device = self.access(addr)?;
        device.registers.insert(addr, u32::from_le_bytes(word));
        Ok(Bytes::copy_from_slice(&word))
    }

    fn read(&self, addr: u32) -> Result<Bytes> {
        validate_access(self, addr, None)?;
        let device = self.access(addr)?;
        let value = device.registers.get(&addr).copied().unwrap_or(0);
        Ok(Bytes::copy_from_slice(&value.to_le_bytes()[..REG_WORD]))
    }

    fn exchange(&self, packet: &[u8], response_len: usize) -> Result<Bytes> {
        {
            let mut device = self.lock();
            if device.name.is_none() {
                return Err(TransportError::Shutdown.into());
            }
            device.operations += 1;
            device.last_packet = Some(Bytes::copy_from_slice(packet));
        }
        let reply = match &self.responder {
            Some(responder) => responder(packet, response_len),
            None => acknowledge(packet, response_len),
        };
        if reply.len() != response_len {
            return Err(TransportError::Protocol(format!(
                "sim device answered {} bytes, {response_len} expected",
                reply.len()
            ))
            .into());
        }
        Ok(Bytes::from(reply))
    }
}

/// Response header echoing the request's id and serial, status zero.
fn acknowledge(packet: &[u8], response_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(PACKET_HEADER_SIZE);
    header.extend_from_slice(&RESPONSE_MAGIC.to_le_bytes());
    header.extend_from_slice(packet.get(4..12).unwrap_or(&[0; 8]));
    header.extend_from_slice(&u32::try_from(response_len).unwrap_or(u32::MAX).to_le_bytes());

    let mut reply = vec![0u8; response_len];
    let n = header.len().min(response_len);
    reply[..n].copy_from_slice(&header[..n]);
    reply
}
