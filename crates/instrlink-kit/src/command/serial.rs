use std::time::Duration;

use bytes::Bytes;
use instrlink_frame::{BlockMode, FrameConfig};
use instrlink_transport::{serial, Target};
use tracing::info;

use super::{validate_access, validate_block, CommandInterface, RegisterProtocol};
use crate::error::{KitError, Result};

/// Register access over a serial port, using the same packets as TCP.
pub struct SerialCommand {
    protocol: RegisterProtocol,
    timeout: Duration,
    address_limit: Option<u32>,
}

impl SerialCommand {
    pub fn new(timeout: Duration) -> Self {
        Self {
            protocol: RegisterProtocol::new(),
            timeout,
            address_limit: None,
        }
    }

    pub fn with_address_limit(mut self, limit: Option<u32>) -> Self {
        self.address_limit = limit;
        self
    }
}

impl CommandInterface for SerialCommand {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn open(&self, target: &Target) -> Result<()> {
        let Target::Serial { port, baud_rate } = target else {
            return Err(KitError::Config(format!(
                "serial command interface cannot open {target}"
            )));
        };
        let link = serial::open(port, *baud_rate, self.timeout)?;
        let config = FrameConfig {
            read_timeout: Some(self.timeout),
            write_timeout: Some(self.timeout),
            ..FrameConfig::default()
        };
        self.protocol.attach(link, config)?;
        info!(%target, "serial command link open");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.protocol.detach();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.protocol.is_attached()
    }

    fn address_limit(&self) -> Option<u32> {
        self.address_limit
    }

    fn exchange(&self, packet: &[u8], response_len: usize) -> Result<Bytes> {
        self.protocol.exchange_packet(packet, response_len)
    }

    fn write(&self, addr: u32, value: &[u8]) -> Result<Bytes> {
        let word = validate_access(self, addr, Some(value))?;
        self.protocol.write(addr, word)
    }

    fn read(&self, addr: u32) -> Result<Bytes> {
        validate_access(self, addr, None)?;
        self.protocol.read(addr)
    }

    fn block_write(&self, base: u32, data: &[u8], mode: BlockMode) -> Result<()> {
        validate_block(self, base, data.len())?;
        self.protocol.block_write(base, data, mode)
    }

    fn block_read(&self, base: u32, length: usize, mode: BlockMode) -> Result<Bytes> {
        validate_block(self, base, length)?;
        self.protocol.block_read(base, length, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_port_fails_to_open() {
        let command = SerialCommand::new(Duration::from_millis(10));
        let target: Target = "serial:///dev/instrlink-no-such-port".parse().unwrap();
        assert_eq!(command.open(&target).unwrap_err().kind(), "transport");
        assert!(!command.is_open());
    }
}
