//! Byte links for instrument communication.
//!
//! Provides a unified stream type over the physical links an instrument can
//! sit behind:
//! - TCP sockets (command port and device-initiated stream port)
//! - Serial ports (behind the `serial` feature)
//! - Local socket pairs (Unix, used for in-process devices)
//!
//! PCIe boards have no byte stream; they are reached through the
//! [`PcieDriver`] trait, which wraps a vendor DMA driver.
//!
//! This is the lowest layer of instrlink. Everything else builds on top of
//! the [`LinkStream`] type and the [`Target`] endpoint parser provided here.

pub mod error;
pub mod pcie;
pub mod stream;
pub mod target;
pub mod tcp;

#[cfg(feature = "serial")]
pub mod serial;

pub use error::{Result, TransportError};
pub use pcie::{DmaDirection, PcieDriver, SimPcieDriver};
pub use stream::LinkStream;
pub use target::Target;
pub use tcp::{default_stream_port, TcpStreamListener};
