/// Errors that can occur while building or using a register schema or
/// command set.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The schema document could not be loaded.
    #[error("failed to load schema: {0}")]
    LoadFailed(String),

    /// The embedded document schema could not be compiled.
    #[error("failed to compile document schema: {0}")]
    CompileFailed(String),

    /// The document does not match the expected layout.
    #[error("schema document invalid: {0}")]
    DocumentInvalid(String),

    /// A register definition is internally inconsistent.
    #[error("register {register}: {reason}")]
    InvalidDefinition { register: String, reason: String },

    /// No register with this name exists.
    #[error("unknown register {0:?}")]
    UnknownRegister(String),

    /// The value does not fit the register field.
    #[error("value out of range for {register}: {detail}")]
    ValueRange { register: String, detail: String },

    /// The value has the wrong kind for the register format.
    #[error("invalid value for {register}: {detail}")]
    InvalidValue { register: String, detail: String },

    /// A command definition is internally inconsistent.
    #[error("command {command}: {reason}")]
    InvalidCommand { command: String, reason: String },

    /// No parameter with this name exists.
    #[error("unknown parameter {0:?}")]
    UnknownParam(String),

    /// No command with this name exists.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// A command response does not match its declared layout.
    #[error("response to {command}: {detail}")]
    ResponseMismatch { command: String, detail: String },

    /// The document is not valid JSON.
    #[error("schema document is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchemaError>;
