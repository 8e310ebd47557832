use std::time::Duration;

use bytes::Bytes;
use instrlink_frame::{BlockMode, FrameConfig};
use instrlink_transport::{tcp, Target};
use tracing::info;

use super::{validate_access, validate_block, CommandInterface, RegisterProtocol};
use crate::error::{KitError, Result};

/// Register access over a TCP command port.
pub struct TcpCommand {
    protocol: RegisterProtocol,
    timeout: Duration,
    address_limit: Option<u32>,
}

impl TcpCommand {
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

impl CommandInterface for TcpCommand {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn open(&self, target: &Target) -> Result<()> {
        let Target::Tcp { host, port } = target else {
            return Err(KitError::Config(format!(
                "tcp command interface cannot open {target}"
            )));
        };
        let link = tcp::connect(host, *port, self.timeout)?;
        let config = FrameConfig {
            read_timeout: Some(self.timeout),
            write_timeout: Some(self.timeout),
            ..FrameConfig::default()
        };
        self.protocol.attach(link, config)?;
        info!(%target, "command link open");
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
    use crate::command::protocol::serve_registers;
    use std::net::TcpListener;

    #[test]
    fn register_access_against_tcp_device() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let writer = stream.try_clone().unwrap();
            serve_registers(stream, writer, Some(0x8));
        });

        let command = TcpCommand::new(Duration::from_secs(2));
        let target: Target = format!("tcp://127.0.0.1:{port}").parse().unwrap();
        command.open(&target).unwrap();
        assert!(command.is_open());

        command.write(0x4, &[0x34, 0x12]).unwrap();
        assert_eq!(&command.read(0x4).unwrap()[..], &[0x34, 0x12, 0, 0]);

        let results = command.bulk_read(&[0x4, 0x8, 0xC]);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(&results[2].as_ref().unwrap()[..], &[0, 0, 0, 0]);

        command.close().unwrap();
        assert!(!command.is_open());
        device.join().unwrap();
    }

    #[test]
    fn connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let command = TcpCommand::new(Duration::from_millis(200));
        let target: Target = format!("tcp://127.0.0.1:{port}").parse().unwrap();
        assert_eq!(command.open(&target).unwrap_err().kind(), "transport");
    }
}
