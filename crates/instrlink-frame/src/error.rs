use instrlink_transport::TransportError;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header starts with the wrong magic number.
    #[error("invalid {kind} magic {found:#x}")]
    InvalidMagic { kind: &'static str, found: u32 },

    /// A response answered a different command than the one sent.
    #[error("unexpected response id {found:#x} (expected {expected:#x})")]
    UnexpectedResponse { expected: u32, found: u32 },

    /// The header is well-formed but its contents are inconsistent.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link failed below the codec.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connection was closed before a complete unit was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
