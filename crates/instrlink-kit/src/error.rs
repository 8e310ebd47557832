use std::time::Duration;

use instrlink_frame::FrameError;
use instrlink_schema::SchemaError;
use instrlink_transport::TransportError;

use crate::resource::TransferId;

/// Errors surfaced by the kit.
///
/// Every lower-layer failure is translated into exactly one of these before
/// it reaches a caller.
#[derive(Debug, thiserror::Error)]
pub enum KitError {
    /// Malformed address, value, length or handle, caught before any wire access.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A symbolic register, parameter or command name is not in the schema.
    #[error("unknown name {0:?}")]
    SchemaLookup(String),

    /// A field value does not fit its register field.
    #[error("value out of range for {register}: {detail}")]
    ValueRange { register: String, detail: String },

    /// The buffer pool cannot satisfy an allocation.
    #[error("cannot allocate {requested} bytes ({available} available)")]
    ResourceExhausted { requested: usize, available: usize },

    /// A buffer or channel still has a transfer in flight.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// The link failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A wait elapsed before the transfer reached a terminal state.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The transfer was cancelled by `break_dma`.
    #[error("transfer {0} cancelled")]
    Cancelled(TransferId),

    /// Configuration was rejected.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// An interface was used before its start call.
    #[error("{0} interface not started")]
    NotStarted(&'static str),

    /// An element of an all-or-nothing batch was not applied because a
    /// sibling failed.
    #[error("batch aborted: {0}")]
    BatchAborted(String),
}

impl KitError {
    /// Short stable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::SchemaLookup(_) => "schema_lookup",
            Self::ValueRange { .. } => "value_range",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::ResourceBusy(_) => "resource_busy",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::NotStarted(_) => "not_started",
            Self::BatchAborted(_) => "batch_aborted",
        }
    }
}

impl From<FrameError> for KitError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Transport(err) => Self::Transport(err),
            FrameError::Io(err) => Self::Transport(TransportError::Io(err)),
            FrameError::ConnectionClosed => Self::Transport(TransportError::Disconnected),
            other => Self::Transport(TransportError::Protocol(other.to_string())),
        }
    }
}

impl From<SchemaError> for KitError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::UnknownRegister(name)
            | SchemaError::UnknownParam(name)
            | SchemaError::UnknownCommand(name) => Self::SchemaLookup(name),
            SchemaError::ResponseMismatch { command, detail } => Self::Transport(
                TransportError::Protocol(format!("response to {command}: {detail}")),
            ),
            SchemaError::ValueRange { register, detail } => Self::ValueRange { register, detail },
            SchemaError::InvalidValue { register, detail } => {
                Self::Validation(format!("{register}: {detail}"))
            }
            other => Self::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, KitError>;
