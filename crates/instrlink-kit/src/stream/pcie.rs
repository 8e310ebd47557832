use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use instrlink_transport::pcie::PCIE_WORD;
use instrlink_transport::{DmaDirection, PcieDriver, Target, TransportError};
use tracing::{debug, info, warn};

use super::{DmaEngine, Movers};
use crate::error::{KitError, Result};
use crate::resource::{Direction, TransferId, TransferTicket};

/// How long one driver call may block before the mover re-checks for
/// cancellation.
pub const DMA_SLICE: Duration = Duration::from_millis(50);

struct Shared {
    driver: Arc<dyn PcieDriver>,
    board: Mutex<Option<u32>>,
    inflight: Mutex<HashMap<TransferId, (u16, DmaDirection)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn run(&self, board: u32, ticket: TransferTicket) {
        let channel = ticket.channel().number();
        let outcome = match ticket.direction() {
            Direction::Send => {
                let payload = ticket.payload();
                self.drive(&ticket, |driver| {
                    driver.dma_to_card(board, channel, &payload, DMA_SLICE)
                })
            }
            Direction::Recv => {
                let mut buf = vec![0u8; ticket.length()];
                let moved = self.drive(&ticket, |driver| {
                    driver.dma_from_card(board, channel, &mut buf, DMA_SLICE)
                });
                if let Ok(Some(n)) = moved {
                    ticket.fill(&buf[..n]);
                }
                moved
            }
        };
        lock(&self.inflight).remove(&ticket.id());
        match outcome {
            Ok(Some(moved)) => {
                ticket.complete(moved);
            }
            Ok(None) => debug!(id = %ticket.id(), "pcie transfer abandoned"),
            Err(err) => {
                warn!(id = %ticket.id(), %err, "pcie transfer failed");
                ticket.fail(err.to_string());
            }
        }
    }

    /// Repeat a driver call until it moves data, fails, or the ticket is
    /// cancelled (`Ok(None)`).
    fn drive(
        &self,
        ticket: &TransferTicket,
        mut call: impl FnMut(&dyn PcieDriver) -> instrlink_transport::Result<Option<usize>>,
    ) -> instrlink_transport::Result<Option<usize>> {
        loop {
            if ticket.is_aborted() {
                return Ok(None);
            }
            if let Some(moved) = call(self.driver.as_ref())? {
                return Ok(Some(moved));
            }
        }
    }
}

/// Stream engine over a PCIe board's DMA channels.
pub struct PcieEngine {
    shared: Arc<Shared>,
    movers: Movers,
}

impl PcieEngine {
    pub fn new(driver: Arc<dyn PcieDriver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                board: Mutex::new(None),
                inflight: Mutex::new(HashMap::new()),
            }),
            movers: Movers::new(),
        }
    }
}

impl DmaEngine for PcieEngine {
    fn name(&self) -> &'static str {
        "pcie"
    }

    fn open(&self, target: &Target) -> Result<()> {
        let Target::Pcie { board } = target else {
            return Err(KitError::Config(format!(
                "pcie stream interface cannot open {target}"
            )));
        };
        let mut current = lock(&self.shared.board);
        if let Some(previous) = current.take() {
            self.shared.driver.close(previous)?;
        }
        self.shared.driver.open(*board)?;
        *current = Some(*board);
        info!(board, "pcie stream open");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.movers.join_all();
        if let Some(board) = lock(&self.shared.board).take() {
            self.shared.driver.close(board)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.shared.board).is_some()
    }

    fn granularity(&self) -> usize {
        PCIE_WORD
    }

    fn submit(&self, ticket: TransferTicket) -> Result<()> {
        let board = lock(&self.shared.board).ok_or(TransportError::Shutdown)?;
        let direction = match ticket.direction() {
            Direction::Send => DmaDirection::HostToCard,
            Direction::Recv => DmaDirection::CardToHost,
        };
        lock(&self.shared.inflight).insert(ticket.id(), (ticket.channel().number(), direction));
        let shared = Arc::clone(&self.shared);
        let name = format!("instrlink-pcie-{}", ticket.id());
        self.movers.spawn(name, move || shared.run(board, ticket))
    }

    fn abort(&self, transfer: TransferId) {
        let Some(board) = *lock(&self.shared.board) else {
            return;
        };
        let entry = lock(&self.shared.inflight).get(&transfer).copied();
        if let Some((channel, direction)) = entry {
            if let Err(err) = self.shared.driver.cancel(board, channel, direction) {
                debug!(%err, "driver cancel failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Channel, ResourceManager, TransferRequest};
    use crate::stream::{DmaStream, StreamInterface};
    use instrlink_transport::SimPcieDriver;
    use std::time::Instant;

    fn opened(driver: Arc<SimPcieDriver>) -> DmaStream<PcieEngine> {
        let stream = DmaStream::new(PcieEngine::new(driver), Arc::new(ResourceManager::new(1 << 16)));
        stream.open(&Target::Pcie { board: 0 }).unwrap();
        stream
    }

    #[test]
    fn dma_loops_back_through_card() {
        let stream = opened(Arc::new(SimPcieDriver::new()));
        let tx = stream.alloc_buffer(16).unwrap();
        let rx = stream.alloc_buffer(16).unwrap();
        stream.get_buffer(tx, 16).unwrap().write(0, &[7u8; 16]).unwrap();

        stream
            .recv_open(&TransferRequest::new(Channel::Physical(1), rx, 16))
            .unwrap();
        stream
            .send_open(&TransferRequest::new(Channel::Physical(1), tx, 16))
            .unwrap();
        assert_eq!(stream.wait_dma(tx, Duration::from_secs(2)).unwrap(), 16);
        assert_eq!(stream.wait_dma(rx, Duration::from_secs(2)).unwrap(), 16);
        assert_eq!(stream.get_buffer(rx, 16).unwrap().to_vec(), vec![7u8; 16]);
        stream.close().unwrap();
    }

    #[test]
    fn unaligned_length_rejected_before_submit() {
        let stream = opened(Arc::new(SimPcieDriver::new()));
        let rx = stream.alloc_buffer(16).unwrap();
        let err = stream
            .recv_open(&TransferRequest::new(Channel::Physical(0), rx, 10))
            .unwrap_err();
        assert!(matches!(err, KitError::Validation(_)));
        assert!(stream.resources().transfers().is_empty());
    }

    #[test]
    fn break_stops_mover_promptly() {
        let stream = opened(Arc::new(SimPcieDriver::new()));
        let rx = stream.alloc_buffer(64).unwrap();
        stream
            .recv_open(&TransferRequest::new(Channel::Physical(0), rx, 64))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        stream.break_dma(rx).unwrap();
        assert!(matches!(
            stream.wait_dma(rx, Duration::from_secs(1)),
            Err(KitError::Cancelled(_))
        ));
        stream.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn injected_card_data_is_received() {
        let driver = Arc::new(SimPcieDriver::new());
        let stream = opened(Arc::clone(&driver));
        let rx = stream.alloc_buffer(8).unwrap();
        stream
            .recv_open(&TransferRequest::new(Channel::Physical(2), rx, 8))
            .unwrap();
        driver.inject(0, 2, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(stream.wait_dma(rx, Duration::from_secs(2)).unwrap(), 8);
        stream.close().unwrap();
    }
}
