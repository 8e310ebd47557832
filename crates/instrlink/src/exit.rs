use std::fmt;
use std::io;

use instrlink_kit::KitError;
use instrlink_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidTarget { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn kit_error(context: &str, err: KitError) -> CliError {
    match err {
        KitError::Transport(err) => transport_error(context, err),
        KitError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        KitError::Validation(_) | KitError::SchemaLookup(_) | KitError::ValueRange { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        KitError::Config(_) | KitError::NotStarted(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kit_errors_map_to_exit_codes() {
        assert_eq!(kit_error("x", KitError::SchemaLookup("NOPE".into())).code, DATA_INVALID);
        assert_eq!(kit_error("x", KitError::Config("bad".into())).code, USAGE);
        assert_eq!(
            kit_error("x", KitError::Timeout(std::time::Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            kit_error("x", KitError::Transport(TransportError::Disconnected)).code,
            TRANSPORT_ERROR
        );
        assert_eq!(kit_error("x", KitError::ResourceBusy("buf#1".into())).code, FAILURE);
    }

    #[test]
    fn connect_refused_is_transport_failure() {
        let err = TransportError::Connect {
            target: "tcp://127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(transport_error("connect", err).code, TRANSPORT_ERROR);
    }
}
