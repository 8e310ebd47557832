use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use instrlink_transport::pcie::PCIE_WORD;
use instrlink_transport::{PcieDriver, Target, TransportError};
use tracing::info;

use super::{validate_access, CommandInterface};
use crate::error::{KitError, Result};

/// Register access over a PCIe board's AXI-lite window.
pub struct PcieCommand {
    driver: Arc<dyn PcieDriver>,
    // Also serializes register access to the board.
    board: Mutex<Option<u32>>,
    address_limit: Option<u32>,
}

impl PcieCommand {
    pub fn new(driver: Arc<dyn PcieDriver>) -> Self {
        Self {
            driver,
            board: Mutex::new(None),
            address_limit: None,
        }
    }

    pub fn with_address_limit(mut self, limit: Option<u32>) -> Self {
        self.address_limit = limit;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<u32>> {
        self.board
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_aligned(addr: u32) -> Result<()> {
        if addr as usize % PCIE_WORD != 0 {
            return Err(KitError::Validation(format!(
                "pcie register address {addr:#x} is not {PCIE_WORD}-byte aligned"
            )));
        }
        Ok(())
    }
}

impl CommandInterface for PcieCommand {
    fn name(&self) -> &'static str {
        "pcie"
    }

    fn open(&self, target: &Target) -> Result<()> {
        let Target::Pcie { board } = target else {
            return Err(KitError::Config(format!(
                "pcie command interface cannot open {target}"
            )));
        };
        let mut current = self.lock();
        if let Some(previous) = current.take() {
            self.driver.close(previous)?;
        }
        self.driver.open(*board)?;
        *current = Some(*board);
        info!(board, info = %self.driver.info(*board), "pcie command interface open");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(board) = self.lock().take() {
            self.driver.close(board)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn address_limit(&self) -> Option<u32> {
        self.address_limit
    }

    fn write(&self, addr: u32, value: &[u8]) -> Result<Bytes> {
        let word = validate_access(self, addr, Some(value))?;
        Self::check_aligned(addr)?;
        let guard = self.lock();
        let board = guard.ok_or(TransportError::Shutdown)?;
        self.driver
            .write_lite(board, addr, u32::from_le_bytes(word))?;
        Ok(Bytes::copy_from_slice(&word))
    }

    fn read(&self, addr: u32) -> Result<Bytes> {
        validate_access(self, addr, None)?;
        Self::check_aligned(addr)?;
        let guard = self.lock();
        let board = guard.ok_or(TransportError::Shutdown)?;
        let value = self.driver.read_lite(board, addr)?;
        Ok(Bytes::copy_from_slice(&value.to_le_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instrlink_transport::SimPcieDriver;

    fn opened() -> PcieCommand {
        let command = PcieCommand::new(Arc::new(SimPcieDriver::new()));
        command.open(&Target::Pcie { board: 0 }).unwrap();
        command
    }

    #[test]
    fn lite_register_roundtrip() {
        let command = opened();
        command.write(0x10, &[5]).unwrap();
        assert_eq!(&command.read(0x10).unwrap()[..], &[5, 0, 0, 0]);
    }

    #[test]
    fn unaligned_address_is_validation() {
        let command = opened();
        assert!(matches!(command.read(0x11), Err(KitError::Validation(_))));
    }

    #[test]
    fn closed_board_refuses() {
        let command = opened();
        command.close().unwrap();
        command.close().unwrap();
        assert!(matches!(
            command.read(0x10),
            Err(KitError::Transport(TransportError::Shutdown))
        ));
    }
}
