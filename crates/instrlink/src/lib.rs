//! Transport-agnostic register and streaming access to instruments.
//!
//! instrlink talks to FPGA-based instruments over TCP, serial links or
//! PCIe. Register operations go through a command interface; bulk data
//! moves through DMA-style buffers on a stream interface. An ordered
//! middleware chain sits in between and adds named registers and virtual
//! channel multiplexing.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte links, endpoint parsing, the PCIe driver boundary
//! - [`frame`]: register packets and channel-tagged stream frames
//! - [`schema`]: register field tables and JSON schema documents
//! - [`kit`]: interfaces, middleware, buffer management and the [`Kit`] facade

/// Re-export transport types.
pub mod transport {
    pub use instrlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use instrlink_frame::*;
}

/// Re-export schema types.
pub mod schema {
    pub use instrlink_schema::*;
}

/// Re-export kit types.
pub mod kit {
    pub use instrlink_kit::*;
}

pub use instrlink_kit::{
    Kit, KitConfig, KitError, LoopMode, LoopSpec, RegisterAddr, RegisterValue, StopSignal,
    StreamRun, StreamSummary,
};
