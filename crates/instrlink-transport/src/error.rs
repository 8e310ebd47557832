/// Errors that can occur on a physical link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a listening socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the target.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming device connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the link.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[error("serial port {port}: {reason}")]
    Serial { port: String, reason: String },

    /// The PCIe driver reported a failure.
    #[error("driver error: {0}")]
    Driver(String),

    /// The device answered but refused the operation.
    #[error("device rejected operation at {address:#x} with status {status:#x}")]
    DeviceStatus { address: u32, status: u32 },

    /// The device answered with something that is not a valid reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The endpoint string could not be understood.
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// The peer went away while an operation was in progress.
    #[error("link disconnected")]
    Disconnected,

    /// A transfer failed on the link; carries the recorded reason.
    #[error("link failure: {0}")]
    Link(String),

    /// The link has been shut down locally.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether this error means the link itself is gone (as opposed to a
    /// single rejected operation).
    pub fn is_link_loss(&self) -> bool {
        match self {
            Self::Disconnected | Self::Shutdown => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
