use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use instrlink_transport::{Target, TransportError};
use tracing::{debug, warn};

use super::StreamInterface;
use crate::error::{KitError, Result};
use crate::resource::{
    BufferId, Direction, ResourceManager, TransferId, TransferRequest, TransferTicket,
};

/// The part of a stream transport that actually moves bytes.
///
/// `submit` must not block on the transfer itself: it either finishes the
/// ticket at once or hands it to a mover that finishes it later. Movers
/// poll [`TransferTicket::is_aborted`] and stop once it is set.
pub trait DmaEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, target: &Target) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Lengths and offsets must be multiples of this.
    fn granularity(&self) -> usize {
        1
    }

    fn submit(&self, ticket: TransferTicket) -> Result<()>;

    /// Hurry a cancelled transfer's mover along.
    fn abort(&self, _transfer: TransferId) {}
}

/// [`StreamInterface`] over any [`DmaEngine`].
pub struct DmaStream<E> {
    engine: E,
    resources: Arc<ResourceManager>,
}

impl<E: DmaEngine> DmaStream<E> {
    pub fn new(engine: E, resources: Arc<ResourceManager>) -> Self {
        Self { engine, resources }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn open_transfer(&self, request: &TransferRequest, direction: Direction) -> Result<TransferId> {
        if !self.engine.is_open() {
            return Err(TransportError::Shutdown.into());
        }
        let granularity = self.engine.granularity();
        if request.length % granularity != 0 || request.offset % granularity != 0 {
            return Err(KitError::Validation(format!(
                "{} transfers need lengths and offsets in multiples of {granularity} bytes",
                self.engine.name()
            )));
        }
        let ticket = self.resources.open_transfer(request, direction)?;
        let id = ticket.id();
        if let Err(err) = self.engine.submit(ticket.clone()) {
            ticket.fail(err.to_string());
            return Err(err);
        }
        Ok(id)
    }
}

impl<E: DmaEngine> StreamInterface for DmaStream<E> {
    fn name(&self) -> &'static str {
        self.engine.name()
    }

    fn open(&self, target: &Target) -> Result<()> {
        self.engine.open(target)
    }

    fn close(&self) -> Result<()> {
        self.cancel_all();
        self.engine.close()
    }

    fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    fn send_open(&self, request: &TransferRequest) -> Result<TransferId> {
        self.open_transfer(request, Direction::Send)
    }

    fn recv_open(&self, request: &TransferRequest) -> Result<TransferId> {
        self.open_transfer(request, Direction::Recv)
    }

    fn break_dma(&self, buffer: BufferId) -> Result<()> {
        if let Some(id) = self.resources.cancel(buffer)? {
            self.engine.abort(id);
        }
        Ok(())
    }

    fn cancel_all(&self) {
        for id in self.resources.cancel_all() {
            self.engine.abort(id);
        }
    }
}

/// Threads moving transfers for an engine.
#[derive(Default)]
pub struct Movers {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Movers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `work` on a named thread.
    pub fn spawn(&self, name: String, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(work)
            .map_err(TransportError::Io)?;
        let mut handles = self.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Wait for every mover to return.
    pub fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self.lock().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                warn!(thread = ?name, "mover thread panicked");
            }
        }
        debug!("movers joined");
    }

    /// Movers still running.
    pub fn active(&self) -> usize {
        self.lock().iter().filter(|handle| !handle.is_finished()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Channel;
    use crate::stream::LoopbackEngine;
    use std::time::Duration;

    fn loopback() -> DmaStream<LoopbackEngine> {
        let stream = DmaStream::new(
            LoopbackEngine::new(),
            Arc::new(ResourceManager::new(1 << 16)),
        );
        stream.open(&"sim://bench".parse().unwrap()).unwrap();
        stream
    }

    #[test]
    fn closed_engine_refuses_transfers() {
        let stream = DmaStream::new(LoopbackEngine::new(), Arc::new(ResourceManager::new(64)));
        let buf = stream.alloc_buffer(8).unwrap();
        let err = stream
            .recv_open(&TransferRequest::new(Channel::Physical(0), buf, 8))
            .unwrap_err();
        assert!(matches!(err, KitError::Transport(TransportError::Shutdown)));
    }

    #[test]
    fn break_unblocks_waiter_and_repeats_quietly() {
        let stream = Arc::new(loopback());
        let buf = stream.alloc_buffer(16).unwrap();
        stream
            .recv_open(&TransferRequest::new(Channel::Physical(1), buf, 16))
            .unwrap();

        let waiter = {
            let stream = Arc::clone(&stream);
            std::thread::spawn(move || stream.wait_dma(buf, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(30));
        stream.break_dma(buf).unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(KitError::Cancelled(_))));

        stream.break_dma(buf).unwrap();
        assert!(matches!(
            stream.wait_dma(buf, Duration::ZERO),
            Err(KitError::Cancelled(_))
        ));
        stream.free_buffer(buf).unwrap();
    }

    #[test]
    fn close_cancels_pending() {
        let stream = loopback();
        let buf = stream.alloc_buffer(16).unwrap();
        stream
            .recv_open(&TransferRequest::new(Channel::Physical(0), buf, 16))
            .unwrap();
        stream.close().unwrap();
        assert!(matches!(
            stream.wait_dma(buf, Duration::ZERO),
            Err(KitError::Cancelled(_))
        ));
    }

    #[test]
    fn movers_join() {
        let movers = Movers::new();
        movers
            .spawn("test-mover".into(), || std::thread::sleep(Duration::from_millis(10)))
            .unwrap();
        movers.join_all();
        assert_eq!(movers.active(), 0);
    }
}
