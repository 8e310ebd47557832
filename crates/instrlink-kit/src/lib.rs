//! Command and stream access to instruments.
//!
//! The kit layers, from the wire up:
//!
//! - [`command`]: register read/write over TCP, serial, PCIe or a simulator
//! - [`stream`]: DMA-style buffer transfers and repeating transfer loops
//! - [`resource`]: the per-kit table of buffers and transfer descriptors
//! - [`middleware`]: ordered stages between the caller and the interfaces
//!   (schema-driven register names and commands, virtual channel
//!   multiplexing)
//! - [`registry`] and [`config`]: name-keyed construction from JSON
//! - [`Kit`]: the facade routing every call to the right layer

pub mod command;
pub mod config;
pub mod error;
pub mod kit;
pub mod middleware;
pub mod registry;
pub mod resource;
pub mod stream;

pub use command::{BulkSemantics, CommandInterface};
pub use config::{IcdConfig, InterfaceConfig, KitConfig, SchemaSource};
pub use error::{KitError, Result};
pub use kit::{Kit, StreamRun, StreamTaskId};
pub use middleware::{Chain, Middleware, RegisterAddr, RegisterValue, WriteAck};
pub use registry::{MiddlewareRegistry, TransportRegistry};
pub use resource::{
    BufferId, BufferView, Channel, Direction, ResourceManager, TransferId, TransferRequest,
    TransferState,
};
pub use stream::looping::{Block, StreamEnd};
pub use stream::{LoopMode, LoopSpec, StopSignal, StreamInterface, StreamOptions, StreamSummary};
