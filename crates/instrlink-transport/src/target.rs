//! Endpoint strings.
//!
//! A target names where a device lives, in URI form:
//!
//! | form | example |
//! |---|---|
//! | `tcp://host:port` | `tcp://192.168.1.152:5001` |
//! | `serial://port?baud=N` | `serial:///dev/ttyUSB0?baud=115200` |
//! | `pcie://board` | `pcie://0` |
//! | `sim://name` | `sim://bench` |

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// Baud rate used when a serial target does not name one.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// A parsed device endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// TCP host and port. Port 0 asks the transport to derive one.
    Tcp { host: String, port: u16 },
    /// Serial port path and baud rate.
    Serial { port: String, baud_rate: u32 },
    /// PCIe board index.
    Pcie { board: u32 },
    /// In-process simulated device.
    Sim { name: String },
}

impl Target {
    /// The URI scheme, which is also the transport name.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Serial { .. } => "serial",
            Self::Pcie { .. } => "pcie",
            Self::Sim { .. } => "sim",
        }
    }

    /// Same target with a different TCP port. Other kinds are returned unchanged.
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            Self::Tcp { host, .. } => Self::Tcp {
                host: host.clone(),
                port,
            },
            other => other.clone(),
        }
    }
}

fn invalid(target: &str, reason: impl Into<String>) -> TransportError {
    TransportError::InvalidTarget {
        target: target.to_string(),
        reason: reason.into(),
    }
}

impl FromStr for Target {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| invalid(s, "missing scheme (expected e.g. tcp://host:port)"))?;
        let (body, query) = match rest.split_once('?') {
            Some((body, query)) => (body, Some(query)),
            None => (rest, None),
        };

        match scheme {
            "tcp" => {
                if query.is_some() {
                    return Err(invalid(s, "tcp targets take no options"));
                }
                let (host, port) = body
                    .rsplit_once(':')
                    .ok_or_else(|| invalid(s, "expected host:port"))?;
                if host.is_empty() {
                    return Err(invalid(s, "empty host"));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid(s, format!("bad port {port:?}")))?;
                Ok(Self::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "serial" => {
                if body.is_empty() {
                    return Err(invalid(s, "empty serial port"));
                }
                let mut baud_rate = DEFAULT_BAUD_RATE;
                for pair in query.into_iter().flat_map(|q| q.split('&')) {
                    match pair.split_once('=') {
                        Some(("baud", value)) => {
                            baud_rate = value
                                .parse()
                                .map_err(|_| invalid(s, format!("bad baud rate {value:?}")))?;
                        }
                        _ => return Err(invalid(s, format!("unknown option {pair:?}"))),
                    }
                }
                Ok(Self::Serial {
                    port: body.to_string(),
                    baud_rate,
                })
            }
            "pcie" => {
                if query.is_some() {
                    return Err(invalid(s, "pcie targets take no options"));
                }
                let board = body
                    .parse::<u32>()
                    .map_err(|_| invalid(s, format!("bad board index {body:?}")))?;
                Ok(Self::Pcie { board })
            }
            "sim" => {
                if query.is_some() {
                    return Err(invalid(s, "sim targets take no options"));
                }
                Ok(Self::Sim {
                    name: body.to_string(),
                })
            }
            other => Err(invalid(s, format!("unknown scheme {other:?}"))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Serial { port, baud_rate } => write!(f, "serial://{port}?baud={baud_rate}"),
            Self::Pcie { board } => write!(f, "pcie://{board}"),
            Self::Sim { name } => write!(f, "sim://{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let target: Target = "tcp://192.168.1.152:5001".parse().unwrap();
        assert_eq!(
            target,
            Target::Tcp {
                host: "192.168.1.152".into(),
                port: 5001
            }
        );
        assert_eq!(target.scheme(), "tcp");
        assert_eq!(target.to_string(), "tcp://192.168.1.152:5001");
    }

    #[test]
    fn test_parse_serial_with_and_without_baud() {
        let target: Target = "serial:///dev/ttyUSB0?baud=115200".parse().unwrap();
        assert_eq!(
            target,
            Target::Serial {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 115200
            }
        );
        let target: Target = "serial://COM3".parse().unwrap();
        assert!(matches!(target, Target::Serial { baud_rate: DEFAULT_BAUD_RATE, .. }));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = "serial:///dev/ttyS0?parity=even".parse::<Target>().unwrap_err();
        assert!(matches!(err, TransportError::InvalidTarget { .. }));
    }

    #[test]
    fn test_bad_inputs_rejected() {
        for bad in ["192.168.1.1:5001", "tcp://:80", "tcp://host:99999", "pcie://x", "usb://1"] {
            assert!(bad.parse::<Target>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_with_port() {
        let target: Target = "tcp://10.0.0.5:0".parse().unwrap();
        assert_eq!(target.with_port(6001).to_string(), "tcp://10.0.0.5:6001");
    }
}
