//! Register access.
//!
//! A [`CommandInterface`] moves numeric register words to and from a
//! device. Values are little-endian byte strings of at most one word; they
//! are zero-padded to a full word before they leave the process.

pub mod pcie;
pub mod protocol;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;
pub mod tcp;

use bytes::Bytes;
use instrlink_frame::{BlockMode, REG_WORD};
use instrlink_transport::Target;

use crate::error::{KitError, Result};

pub use pcie::PcieCommand;
pub use protocol::RegisterProtocol;
#[cfg(feature = "serial")]
pub use serial::SerialCommand;
pub use sim::SimCommand;
pub use tcp::TcpCommand;

/// How a transport treats the elements of one bulk call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkSemantics {
    /// Each element succeeds or fails on its own.
    PerElement,
    /// The first failure fails every element after it.
    AllOrNothing,
}

/// Register-level access to one device.
///
/// Calls on one instance are serialized by the implementation; several
/// threads may share it.
pub trait CommandInterface: Send + Sync {
    /// Transport name, as registered.
    fn name(&self) -> &'static str;

    /// Connect to `target`. Reopening an open interface closes it first.
    fn open(&self, target: &Target) -> Result<()>;

    /// Disconnect. Closing a closed interface is a no-op.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Register word width in bytes.
    fn word_size(&self) -> usize {
        REG_WORD
    }

    /// Highest accepted byte address, if the transport has one.
    fn address_limit(&self) -> Option<u32> {
        None
    }

    fn bulk_semantics(&self) -> BulkSemantics {
        BulkSemantics::PerElement
    }

    /// Send a complete command packet and return the device's reply of
    /// exactly `response_len` bytes. Links with no packet framing refuse.
    fn exchange(&self, _packet: &[u8], _response_len: usize) -> Result<Bytes> {
        Err(KitError::Config(format!(
            "{} interface does not carry command packets",
            self.name()
        )))
    }

    /// Write one register. Returns the device's confirmation bytes.
    fn write(&self, addr: u32, value: &[u8]) -> Result<Bytes>;

    /// Read one register word.
    fn read(&self, addr: u32) -> Result<Bytes>;

    /// Write several registers. One result per element, in input order.
    fn bulk_write(&self, items: &[(u32, Bytes)]) -> Vec<Result<Bytes>> {
        items
            .iter()
            .map(|(addr, value)| self.write(*addr, value))
            .collect()
    }

    /// Read several registers. One result per element, in input order.
    fn bulk_read(&self, addrs: &[u32]) -> Vec<Result<Bytes>> {
        addrs.iter().map(|addr| self.read(*addr)).collect()
    }

    /// Write `data` as consecutive words starting at `base`, or repeatedly
    /// to `base` in loop mode.
    fn block_write(&self, base: u32, data: &[u8], mode: BlockMode) -> Result<()> {
        let word = self.word_size();
        for (index, chunk) in data.chunks(word).enumerate() {
            let addr = block_address(base, index, word, mode)?;
            self.write(addr, chunk)?;
        }
        Ok(())
    }

    /// Read `length` bytes as consecutive words starting at `base`, or
    /// repeatedly from `base` in loop mode.
    fn block_read(&self, base: u32, length: usize, mode: BlockMode) -> Result<Bytes> {
        let word = self.word_size();
        let mut out = Vec::with_capacity(length.div_ceil(word) * word);
        for index in 0..length.div_ceil(word) {
            let addr = block_address(base, index, word, mode)?;
            out.extend_from_slice(&self.read(addr)?);
        }
        out.truncate(length);
        Ok(Bytes::from(out))
    }
}

fn block_address(base: u32, index: usize, word: usize, mode: BlockMode) -> Result<u32> {
    match mode {
        BlockMode::Loop => Ok(base),
        BlockMode::Increment => u32::try_from(index * word)
            .ok()
            .and_then(|step| base.checked_add(step))
            .ok_or_else(|| {
                KitError::Validation(format!("block at {base:#x} runs past the address space"))
            }),
    }
}

/// Check an access against the interface's limits and pad the value to a
/// full word. Nothing is sent when this fails.
pub fn validate_access(
    interface: &dyn CommandInterface,
    addr: u32,
    value: Option<&[u8]>,
) -> Result<[u8; REG_WORD]> {
    if let Some(limit) = interface.address_limit() {
        if addr > limit {
            return Err(KitError::Validation(format!(
                "address {addr:#x} exceeds limit {limit:#x} on {}",
                interface.name()
            )));
        }
    }
    let mut word = [0u8; REG_WORD];
    if let Some(value) = value {
        if value.is_empty() || value.len() > REG_WORD {
            return Err(KitError::Validation(format!(
                "register value must be 1..={REG_WORD} bytes, got {}",
                value.len()
            )));
        }
        word[..value.len()].copy_from_slice(value);
    }
    Ok(word)
}

/// Check a block transfer's bounds before it is sent.
pub fn validate_block(interface: &dyn CommandInterface, base: u32, length: usize) -> Result<()> {
    if length == 0 {
        return Err(KitError::Validation("block length must be non-zero".into()));
    }
    let end = u32::try_from(length)
        .ok()
        .and_then(|len| base.checked_add(len - 1))
        .ok_or_else(|| KitError::Validation(format!("block at {base:#x} is too long")))?;
    if let Some(limit) = interface.address_limit() {
        if end > limit {
            return Err(KitError::Validation(format!(
                "block {base:#x}..={end:#x} exceeds limit {limit:#x} on {}",
                interface.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_block_ops_walk_words() {
        let sim = SimCommand::new();
        sim.open(&"sim://regs".parse().unwrap()).unwrap();

        sim.block_write(0x100, &[1, 0, 0, 0, 2, 0, 0, 0, 3], BlockMode::Increment)
            .unwrap();
        assert_eq!(sim.peek(0x100), 1);
        assert_eq!(sim.peek(0x104), 2);
        assert_eq!(sim.peek(0x108), 3);

        let data = sim.block_read(0x100, 6, BlockMode::Increment).unwrap();
        assert_eq!(&data[..], &[1, 0, 0, 0, 2, 0]);

        sim.block_write(0x200, &[9, 0, 0, 0, 7, 0, 0, 0], BlockMode::Loop)
            .unwrap();
        assert_eq!(sim.peek(0x200), 7);
        assert_eq!(sim.peek(0x204), 0);
    }

    #[test]
    fn values_are_padded_and_checked() {
        let sim = SimCommand::new().with_address_limit(0xFF);
        assert_eq!(validate_access(&sim, 0x10, Some(&[5])).unwrap(), [5, 0, 0, 0]);
        assert!(matches!(
            validate_access(&sim, 0x10, Some(&[1, 2, 3, 4, 5])),
            Err(KitError::Validation(_))
        ));
        assert!(matches!(
            validate_access(&sim, 0x100, None),
            Err(KitError::Validation(_))
        ));
        assert!(validate_block(&sim, 0xF0, 16).is_ok());
        assert!(validate_block(&sim, 0xF0, 17).is_err());
        assert!(validate_block(&sim, 0, 0).is_err());
    }
}
