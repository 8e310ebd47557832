//! PCIe board access.
//!
//! PCIe boards are reached through a vendor DMA driver rather than a byte
//! stream. [`PcieDriver`] is the boundary to that driver: board lifecycle,
//! AXI-lite register access, and blocking DMA in both directions bounded by
//! a per-call timeout. [`SimPcieDriver`] implements it in memory.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, TransportError};

/// Direction of a DMA movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// Host memory to the card.
    HostToCard,
    /// Card to host memory.
    CardToHost,
}

/// DMA transfer sizes and register addresses must be multiples of this.
pub const PCIE_WORD: usize = 4;

/// Boundary to a PCIe DMA driver.
///
/// DMA calls block for at most `timeout` and return `Ok(None)` if nothing
/// was moved in that time, so callers can re-check cancellation between
/// calls. A returned `Some(n)` means the whole movement finished.
pub trait PcieDriver: Send + Sync {
    /// Open a board for use.
    fn open(&self, board: u32) -> Result<()>;

    /// Close a board.
    fn close(&self, board: u32) -> Result<()>;

    /// Human-readable board description.
    fn info(&self, board: u32) -> String {
        format!("pcie board {board}")
    }

    /// Write one AXI-lite register.
    fn write_lite(&self, board: u32, addr: u32, value: u32) -> Result<()>;

    /// Read one AXI-lite register.
    fn read_lite(&self, board: u32, addr: u32) -> Result<u32>;

    /// Move `data` to the card on `channel`.
    fn dma_to_card(
        &self,
        board: u32,
        channel: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Option<usize>>;

    /// Fill `buf` from the card on `channel`.
    fn dma_from_card(
        &self,
        board: u32,
        channel: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>>;

    /// Ask the driver to abandon movement on a channel.
    fn cancel(&self, _board: u32, _channel: u16, _direction: DmaDirection) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct SimState {
    // Open count per board; the command and stream sides each hold one.
    open: HashMap<u32, usize>,
    registers: HashMap<(u32, u32), u32>,
    // Bytes sent to the card on a channel come back out of the same channel.
    fifos: HashMap<(u32, u16), VecDeque<u8>>,
}

/// In-memory PCIe driver.
///
/// Registers are a plain map per board. Each DMA channel is a loopback FIFO:
/// data sent to the card on channel `c` is what the card returns on `c`.
/// [`SimPcieDriver::inject`] adds card-produced data directly.
#[derive(Default)]
pub struct SimPcieDriver {
    state: Mutex<SimState>,
    data_ready: Condvar,
}

impl SimPcieDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue card-produced bytes on a channel.
    pub fn inject(&self, board: u32, channel: u16, data: &[u8]) {
        let mut state = self.lock();
        state
            .fifos
            .entry((board, channel))
            .or_default()
            .extend(data.iter().copied());
        self.data_ready.notify_all();
    }

    /// Bytes waiting on a channel.
    pub fn pending(&self, board: u32, channel: u16) -> usize {
        self.lock().fifos.get(&(board, channel)).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(state: &SimState, board: u32) -> Result<()> {
        if state.open.contains_key(&board) {
            Ok(())
        } else {
            Err(TransportError::Driver(format!("board {board} is not open")))
        }
    }

    fn check_aligned(what: &str, value: usize) -> Result<()> {
        if value % PCIE_WORD == 0 {
            Ok(())
        } else {
            Err(TransportError::Driver(format!(
                "{what} {value} is not a multiple of {PCIE_WORD}"
            )))
        }
    }
}

impl PcieDriver for SimPcieDriver {
    fn open(&self, board: u32) -> Result<()> {
        *self.lock().open.entry(board).or_default() += 1;
        debug!(board, "sim pcie board opened");
        Ok(())
    }

    fn close(&self, board: u32) -> Result<()> {
        let mut state = self.lock();
        if let Some(count) = state.open.get_mut(&board) {
            *count -= 1;
            if *count == 0 {
                state.open.remove(&board);
            }
        }
        drop(state);
        self.data_ready.notify_all();
        Ok(())
    }

    fn info(&self, board: u32) -> String {
        format!("simulated pcie board {board}")
    }

    fn write_lite(&self, board: u32, addr: u32, value: u32) -> Result<()> {
        Self::check_aligned("register address", addr as usize)?;
        let mut state = self.lock();
        Self::ensure_open(&state, board)?;
        state.registers.insert((board, addr), value);
        Ok(())
    }

    fn read_lite(&self, board: u32, addr: u32) -> Result<u32> {
        Self::check_aligned("register address", addr as usize)?;
        let state = self.lock();
        Self::ensure_open(&state, board)?;
        Ok(state.registers.get(&(board, addr)).copied().unwrap_or(0))
    }

    fn dma_to_card(
        &self,
        board: u32,
        channel: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<Option<usize>> {
        Self::check_aligned("dma length", data.len())?;
        let mut state = self.lock();
        Self::ensure_open(&state, board)?;
        state
            .fifos
            .entry((board, channel))
            .or_default()
            .extend(data.iter().copied());
        self.data_ready.notify_all();
        Ok(Some(data.len()))
    }

    fn dma_from_card(
        &self,
        board: u32,
        channel: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>> {
        Self::check_aligned("dma length", buf.len())?;
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            Self::ensure_open(&state, board)?;
            let available = state.fifos.get(&(board, channel)).map_or(0, VecDeque::len);
            let wanted = buf.len();
            if available >= wanted {
                if let Some(fifo) = state.fifos.get_mut(&(board, channel)) {
                    for (slot, byte) in buf.iter_mut().zip(fifo.drain(..wanted)) {
                        *slot = byte;
                    }
                }
                return Ok(Some(wanted));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .data_ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn cancel(&self, _board: u32, _channel: u16, _direction: DmaDirection) -> Result<()> {
        self.data_ready.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lite_registers_roundtrip() {
        let driver = SimPcieDriver::new();
        driver.open(0).unwrap();
        driver.write_lite(0, 0x10, 0xdead_beef).unwrap();
        assert_eq!(driver.read_lite(0, 0x10).unwrap(), 0xdead_beef);
        assert_eq!(driver.read_lite(0, 0x14).unwrap(), 0);
    }

    #[test]
    fn test_closed_board_rejected() {
        let driver = SimPcieDriver::new();
        let err = driver.write_lite(3, 0x0, 1).unwrap_err();
        assert!(matches!(err, TransportError::Driver(_)));
    }

    #[test]
    fn test_board_stays_open_until_last_close() {
        let driver = SimPcieDriver::new();
        driver.open(1).unwrap();
        driver.open(1).unwrap();
        driver.close(1).unwrap();
        assert!(driver.read_lite(1, 0x0).is_ok());
        driver.close(1).unwrap();
        assert!(driver.read_lite(1, 0x0).is_err());
    }

    #[test]
    fn test_unaligned_rejected() {
        let driver = SimPcieDriver::new();
        driver.open(0).unwrap();
        assert!(driver.read_lite(0, 0x3).is_err());
        assert!(driver
            .dma_to_card(0, 0, &[1, 2, 3], Duration::ZERO)
            .is_err());
    }

    #[test]
    fn test_dma_loopback_and_timeout() {
        let driver = SimPcieDriver::new();
        driver.open(0).unwrap();

        let mut buf = [0u8; 8];
        let moved = driver
            .dma_from_card(0, 1, &mut buf, Duration::from_millis(10))
            .unwrap();
        assert_eq!(moved, None);

        driver
            .dma_to_card(0, 1, &[1, 2, 3, 4, 5, 6, 7, 8], Duration::ZERO)
            .unwrap();
        let moved = driver
            .dma_from_card(0, 1, &mut buf, Duration::from_millis(10))
            .unwrap();
        assert_eq!(moved, Some(8));
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_inject_wakes_waiting_reader() {
        let driver = std::sync::Arc::new(SimPcieDriver::new());
        driver.open(0).unwrap();
        let reader = std::sync::Arc::clone(&driver);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            let moved = reader
                .dma_from_card(0, 2, &mut buf, Duration::from_secs(2))
                .unwrap();
            (moved, buf)
        });
        std::thread::sleep(Duration::from_millis(20));
        driver.inject(0, 2, &[9, 9, 9, 9]);
        assert_eq!(handle.join().unwrap(), (Some(4), [9, 9, 9, 9]));
    }
}
