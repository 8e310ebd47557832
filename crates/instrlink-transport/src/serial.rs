use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::LinkStream;

/// Open a serial port as a link.
pub fn open(port: &str, baud_rate: u32, timeout: Duration) -> Result<LinkStream> {
    let serial = serialport::new(port, baud_rate)
        .timeout(timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| TransportError::Serial {
            port: port.to_string(),
            reason: e.to_string(),
        })?;
    debug!(port, baud_rate, "opened serial port");
    Ok(LinkStream::from_serial(serial))
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(|e| TransportError::Serial {
        port: String::new(),
        reason: e.to_string(),
    })?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
