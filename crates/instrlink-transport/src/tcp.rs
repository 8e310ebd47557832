use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::LinkStream;

/// Stream port used when none is configured and none can be derived.
pub const FALLBACK_STREAM_PORT: u16 = 6001;

/// Connect to a device's command port (blocking, bounded by `timeout`).
pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<LinkStream> {
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect {
            target: target.clone(),
            source: e,
        })?
        .collect();

    let mut last_err = std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "host resolved to no addresses",
    );
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                debug!(%addr, "connected to device");
                return Ok(LinkStream::from_tcp(stream));
            }
            Err(e) => last_err = e,
        }
    }
    Err(TransportError::Connect {
        target,
        source: last_err,
    })
}

/// Derive the stream port a device dials back on from its IPv4 address.
///
/// The last two digits `xy` of the final octet give port `x00y`
/// (`192.168.1.152` → 5002). Anything that is not a dotted IPv4 address of
/// at least twelve characters with a two-digit final octet falls back to
/// [`FALLBACK_STREAM_PORT`].
pub fn default_stream_port(host: &str) -> u16 {
    let octets: Vec<&str> = host.split('.').collect();
    let well_formed = host.len() >= 12
        && octets.len() == 4
        && octets
            .iter()
            .all(|o| (1..=3).contains(&o.len()) && o.bytes().all(|b| b.is_ascii_digit()));
    if !well_formed {
        return FALLBACK_STREAM_PORT;
    }
    let last = octets[3].as_bytes();
    if last.len() < 2 {
        return FALLBACK_STREAM_PORT;
    }
    let tens = (last[last.len() - 2] - b'0') as u16;
    let ones = (last[last.len() - 1] - b'0') as u16;
    tens * 1000 + ones
}

/// Listening socket the device connects into for bulk data.
///
/// The device initiates the stream connection; the host side binds and
/// accepts lazily, the first time a transfer needs the link.
pub struct TcpStreamListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpStreamListener {
    /// Bind and listen on all interfaces at `port`.
    pub fn bind(port: u16) -> Result<Self> {
        let bind_addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&bind_addr).map_err(|e| TransportError::Bind {
            addr: bind_addr.clone(),
            source: e,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::Bind {
                addr: bind_addr.clone(),
                source: e,
            })?;
        let addr = listener.local_addr()?;
        info!(%addr, "listening for device stream connection");
        Ok(Self { listener, addr })
    }

    /// Accept the device connection, polling every `poll` until one arrives
    /// or `keep_waiting` returns false (then `Ok(None)`).
    pub fn accept_until(
        &self,
        poll: Duration,
        mut keep_waiting: impl FnMut() -> bool,
    ) -> Result<Option<LinkStream>> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false).map_err(TransportError::Accept)?;
                    stream.set_nodelay(true).map_err(TransportError::Accept)?;
                    info!(%peer, "device stream connected");
                    return Ok(Some(LinkStream::from_tcp(stream)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if !keep_waiting() {
                        return Ok(None);
                    }
                    std::thread::sleep(poll);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Accept(e)),
            }
        }
    }

    /// The bound address (useful when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_default_stream_port() {
        assert_eq!(default_stream_port("192.168.1.152"), 5002);
        assert_eq!(default_stream_port("192.168.1.27"), 2007);
        assert_eq!(default_stream_port("10.0.0.5"), FALLBACK_STREAM_PORT);
        assert_eq!(default_stream_port("192.168.10.5"), FALLBACK_STREAM_PORT);
        assert_eq!(default_stream_port("device.local"), FALLBACK_STREAM_PORT);
    }

    #[test]
    fn test_default_stream_port_rejects_signed_octets() {
        assert_eq!(default_stream_port("192.168.1.+5"), FALLBACK_STREAM_PORT);
        assert_eq!(default_stream_port("192.168.+1.52"), FALLBACK_STREAM_PORT);
        assert_eq!(default_stream_port("192.168.001.052"), 5002);
    }

    #[test]
    fn test_listener_accepts_device_connection() {
        let listener = TcpStreamListener::bind(0).unwrap();
        let port = listener.local_addr().port();

        let handle = std::thread::spawn(move || {
            let mut device = connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
            device.write_all(b"data").unwrap();
        });

        let mut link = listener
            .accept_until(Duration::from_millis(5), || true)
            .unwrap()
            .expect("device should connect");
        let mut buf = [0u8; 4];
        link.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"data");
        handle.join().unwrap();
    }

    #[test]
    fn test_accept_gives_up_when_told() {
        let listener = TcpStreamListener::bind(0).unwrap();
        let mut polls = 0;
        let result = listener
            .accept_until(Duration::from_millis(1), || {
                polls += 1;
                polls < 3
            })
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = connect("127.0.0.1", port, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
