use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use instrlink_transport::{Target, TransportError};
use tracing::{debug, info};

use super::DmaEngine;
use crate::error::{KitError, Result};
use crate::resource::{Direction, TransferId, TransferTicket};

#[derive(Default)]
struct LoopState {
    open: bool,
    // Device-side bytes per physical channel.
    fifos: HashMap<u16, VecDeque<u8>>,
    // At most one receive per channel, enforced by the resource manager.
    waiting: HashMap<u16, TransferTicket>,
}

impl LoopState {
    /// Complete the waiting receive on `channel` if enough bytes are queued.
    fn deliver(&mut self, channel: u16) {
        let Some(ticket) = self.waiting.get(&channel) else {
            return;
        };
        if ticket.is_aborted() {
            self.waiting.remove(&channel);
            return;
        }
        let wanted = ticket.length();
        let fifo = self.fifos.entry(channel).or_default();
        if fifo.len() < wanted {
            return;
        }
        let data: Vec<u8> = fifo.drain(..wanted).collect();
        if let Some(ticket) = self.waiting.remove(&channel) {
            ticket.fill(&data);
            ticket.complete(wanted);
        }
    }
}

/// Stream engine behind `sim://` targets.
///
/// Bytes sent on a channel become receivable on the same channel, and
/// [`LoopbackEngine::inject`] adds device-produced bytes. A receive
/// completes once its whole length is available.
#[derive(Default)]
pub struct LoopbackEngine {
    state: Mutex<LoopState>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue device-produced bytes on a channel.
    pub fn inject(&self, channel: u16, data: &[u8]) {
        let mut state = self.lock();
        state
            .fifos
            .entry(channel)
            .or_default()
            .extend(data.iter().copied());
        state.deliver(channel);
    }

    /// Bytes queued on a channel and not yet received.
    pub fn pending(&self, channel: u16) -> usize {
        self.lock().fifos.get(&channel).map_or(0, VecDeque::len)
    }

    /// Drop the link: every waiting receive fails and later submits are refused.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.open = false;
        for (_, ticket) in state.waiting.drain() {
            ticket.fail("link disconnected");
        }
        info!("loopback link disconnected");
    }
}

impl DmaEngine for LoopbackEngine {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn open(&self, target: &Target) -> Result<()> {
        if !matches!(target, Target::Sim { .. }) {
            return Err(KitError::Config(format!(
                "sim stream interface cannot open {target}"
            )));
        }
        self.lock().open = true;
        debug!(%target, "loopback stream open");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock();
        state.open = false;
        state.waiting.clear();
        state.fifos.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn submit(&self, ticket: TransferTicket) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(TransportError::Disconnected.into());
        }
        let channel = ticket.channel().number();
        match ticket.direction() {
            Direction::Send => {
                let payload = ticket.payload();
                state
                    .fifos
                    .entry(channel)
                    .or_default()
                    .extend(payload.iter().copied());
                ticket.complete(payload.len());
            }
            Direction::Recv => {
                state.waiting.insert(channel, ticket);
            }
        }
        state.deliver(channel);
        Ok(())
    }

    fn abort(&self, transfer: TransferId) {
        self.lock().waiting.retain(|_, ticket| ticket.id() != transfer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Channel, ResourceManager, TransferRequest};
    use crate::stream::{DmaStream, StreamInterface};
    use std::sync::Arc;
    use std::time::Duration;

    fn stream() -> DmaStream<LoopbackEngine> {
        let stream = DmaStream::new(LoopbackEngine::new(), Arc::new(ResourceManager::new(4096)));
        stream.open(&"sim://loop".parse().unwrap()).unwrap();
        stream
    }

    fn request(channel: u16, buffer: crate::resource::BufferId, length: usize) -> TransferRequest {
        TransferRequest::new(Channel::Physical(channel), buffer, length)
    }

    #[test]
    fn send_comes_back_on_same_channel() {
        let stream = stream();
        let tx = stream.alloc_buffer(8).unwrap();
        let rx = stream.alloc_buffer(8).unwrap();
        stream.get_buffer(tx, 8).unwrap().write(0, b"abcdefgh").unwrap();

        stream.recv_open(&request(3, rx, 8)).unwrap();
        assert!(matches!(stream.wait_dma(rx, Duration::ZERO), Err(KitError::Timeout(_))));

        stream.send_open(&request(3, tx, 8)).unwrap();
        assert_eq!(stream.wait_dma(tx, Duration::ZERO).unwrap(), 8);
        assert_eq!(stream.wait_dma(rx, Duration::from_secs(1)).unwrap(), 8);
        assert_eq!(stream.get_buffer(rx, 8).unwrap().to_vec(), b"abcdefgh");
    }

    #[test]
    fn receive_waits_for_full_length_at_offset() {
        let stream = stream();
        let rx = stream.alloc_buffer(16).unwrap();
        stream.recv_open(&request(0, rx, 4).at_offset(8)).unwrap();

        stream.engine().inject(0, &[1, 2]);
        assert!(matches!(stream.wait_dma(rx, Duration::ZERO), Err(KitError::Timeout(_))));
        stream.engine().inject(0, &[3, 4, 5]);
        assert_eq!(stream.wait_dma(rx, Duration::ZERO).unwrap(), 4);
        assert_eq!(stream.get_buffer(rx, 16).unwrap().read(8, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(stream.engine().pending(0), 1);
    }

    #[test]
    fn disconnect_fails_waiters() {
        let stream = Arc::new(stream());
        let rx = stream.alloc_buffer(8).unwrap();
        stream.recv_open(&request(0, rx, 8)).unwrap();

        let waiter = {
            let stream = Arc::clone(&stream);
            std::thread::spawn(move || stream.wait_dma(rx, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        stream.engine().disconnect();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(KitError::Transport(TransportError::Link(_)))
        ));
        stream.free_buffer(rx).unwrap();
        assert!(stream.recv_open(&request(0, stream.alloc_buffer(8).unwrap(), 8)).is_err());
    }
}
