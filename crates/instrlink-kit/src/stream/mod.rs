//! DMA-style streaming.
//!
//! A [`StreamInterface`] hands out buffers from its kit's
//! [`ResourceManager`] and moves transfers between those buffers and the
//! device. Transports plug in as a [`DmaEngine`] behind the generic
//! [`DmaStream`].

pub mod dma;
pub mod looping;
pub mod loopback;
pub mod pcie;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use instrlink_transport::Target;

use crate::error::Result;
use crate::resource::{BufferId, BufferView, ResourceManager, TransferId, TransferRequest};

pub use dma::{DmaEngine, DmaStream, Movers};
pub use looping::{LoopMode, LoopSpec, StopSignal, StreamOptions, StreamSummary};
pub use loopback::LoopbackEngine;
pub use pcie::PcieEngine;
pub use tcp::TcpEngine;

/// Buffer-based transfers to and from one device.
pub trait StreamInterface: Send + Sync {
    /// Transport name, as registered.
    fn name(&self) -> &'static str;

    fn open(&self, target: &Target) -> Result<()>;

    /// Cancel everything pending and disconnect.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// The manager owning this interface's buffers and descriptors.
    fn resources(&self) -> &Arc<ResourceManager>;

    fn alloc_buffer(&self, length: usize) -> Result<BufferId> {
        self.resources().alloc(length)
    }

    fn free_buffer(&self, buffer: BufferId) -> Result<()> {
        self.resources().free(buffer)
    }

    fn get_buffer(&self, buffer: BufferId, length: usize) -> Result<BufferView> {
        self.resources().get_buffer(buffer, length)
    }

    /// Start moving the request's region to the device.
    fn send_open(&self, request: &TransferRequest) -> Result<TransferId>;

    /// Start filling the request's region from the device.
    fn recv_open(&self, request: &TransferRequest) -> Result<TransferId>;

    /// Wait for the latest transfer on `buffer`. A zero timeout polls.
    fn wait_dma(&self, buffer: BufferId, timeout: Duration) -> Result<usize> {
        self.resources().wait(buffer, timeout)
    }

    /// Cancel the pending transfer on `buffer`. A no-op if none is pending.
    fn break_dma(&self, buffer: BufferId) -> Result<()>;

    /// Cancel every pending transfer.
    fn cancel_all(&self);
}
