//! The middleware chain.
//!
//! Stages sit between the kit and its interfaces. A call enters the first
//! stage, which hands it on through the `next` handle it is given; results
//! come back through the same stages in exact reverse order. A stage that
//! does not care about a call forwards it unchanged, which is what every
//! default method does.

pub mod schema;
pub mod virtual_channel;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use instrlink_frame::REG_WORD;
use instrlink_schema::FieldValue;

use crate::command::CommandInterface;
use crate::error::{KitError, Result};
use crate::resource::{BufferId, ResourceManager, TransferId, TransferRequest};
use crate::stream::StreamInterface;

pub use schema::SchemaRegisterMiddleware;
pub use virtual_channel::{VirtualChannelMiddleware, VirtualChannelTable};

/// A register named symbolically or by byte address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterAddr {
    Symbol(String),
    Numeric(u32),
}

impl From<&str> for RegisterAddr {
    fn from(name: &str) -> Self {
        Self::Symbol(name.to_string())
    }
}

impl From<String> for RegisterAddr {
    fn from(name: String) -> Self {
        Self::Symbol(name)
    }
}

impl From<u32> for RegisterAddr {
    fn from(addr: u32) -> Self {
        Self::Numeric(addr)
    }
}

impl fmt::Display for RegisterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symbol(name) => f.write_str(name),
            Self::Numeric(addr) => write!(f, "{addr:#x}"),
        }
    }
}

/// A value going to or coming from a register.
///
/// Numeric addresses carry raw little-endian bytes. Schema fields carry a
/// typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Raw(Bytes),
    Field(FieldValue),
}

impl RegisterValue {
    /// The value as a register word, when it is one.
    pub fn as_word(&self) -> Result<u32> {
        match self {
            Self::Raw(bytes) => word_from_bytes(bytes),
            Self::Field(FieldValue::Int(v)) => u32::try_from(*v)
                .map_err(|_| KitError::Validation(format!("{v} does not fit a register word"))),
            Self::Field(other) => Err(KitError::Validation(format!(
                "{other} is not a raw register value"
            ))),
        }
    }
}

impl From<FieldValue> for RegisterValue {
    fn from(value: FieldValue) -> Self {
        Self::Field(value)
    }
}

impl From<i64> for RegisterValue {
    fn from(value: i64) -> Self {
        Self::Field(FieldValue::Int(value))
    }
}

impl From<f64> for RegisterValue {
    fn from(value: f64) -> Self {
        Self::Field(FieldValue::Float(value))
    }
}

impl From<&str> for RegisterValue {
    fn from(label: &str) -> Self {
        Self::Field(FieldValue::Label(label.to_string()))
    }
}

impl From<Bytes> for RegisterValue {
    fn from(bytes: Bytes) -> Self {
        Self::Raw(bytes)
    }
}

impl From<Vec<u8>> for RegisterValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(Bytes::from(bytes))
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(bytes) => match word_from_bytes(bytes) {
                Ok(word) => write!(f, "{word:#010x}"),
                Err(_) => write!(f, "{:02x?}", &bytes[..]),
            },
            Self::Field(value) => write!(f, "{value}"),
        }
    }
}

/// Little-endian word from at most [`REG_WORD`] bytes.
pub fn word_from_bytes(bytes: &[u8]) -> Result<u32> {
    if bytes.len() > REG_WORD {
        return Err(KitError::Validation(format!(
            "register value must be at most {REG_WORD} bytes, got {}",
            bytes.len()
        )));
    }
    let mut word = [0u8; REG_WORD];
    word[..bytes.len()].copy_from_slice(bytes);
    Ok(u32::from_le_bytes(word))
}

/// Device confirmation of a register write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// Byte address the word was written to.
    pub address: u32,
    pub confirmation: Bytes,
}

/// One stage of the chain.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn write(&self, addr: RegisterAddr, value: RegisterValue, next: RegisterNext<'_>) -> Result<WriteAck> {
        next.write(addr, value)
    }

    fn read(&self, addr: RegisterAddr, next: RegisterNext<'_>) -> Result<RegisterValue> {
        next.read(addr)
    }

    fn bulk_write(
        &self,
        items: Vec<(RegisterAddr, RegisterValue)>,
        next: RegisterNext<'_>,
    ) -> Vec<Result<WriteAck>> {
        next.bulk_write(items)
    }

    fn bulk_read(&self, addrs: Vec<RegisterAddr>, next: RegisterNext<'_>) -> Vec<Result<RegisterValue>> {
        next.bulk_read(addrs)
    }

    /// Run a named command from the parameter table. Returns the device's
    /// raw response.
    fn execute(&self, command: &str, payload: &[u8], next: RegisterNext<'_>) -> Result<Bytes> {
        next.execute(command, payload)
    }

    fn exchange(&self, packet: Bytes, response_len: usize, next: RegisterNext<'_>) -> Result<Bytes> {
        next.exchange(packet, response_len)
    }

    fn send_open(&self, request: &TransferRequest, next: &StreamNext) -> Result<TransferId> {
        next.send_open(request)
    }

    fn recv_open(&self, request: &TransferRequest, next: &StreamNext) -> Result<TransferId> {
        next.recv_open(request)
    }

    fn break_dma(&self, buffer: BufferId, next: &StreamNext) -> Result<()> {
        next.break_dma(buffer)
    }

    /// Called once the stream interface is open, in chain order.
    fn attach_stream(&self, _next: &StreamNext) -> Result<()> {
        Ok(())
    }

    /// Called before the stream interface closes, in reverse chain order.
    fn detach_stream(&self) {}
}

/// The rest of the chain below a stage, for register operations.
#[derive(Clone, Copy)]
pub struct RegisterNext<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn CommandInterface,
}

impl<'a> RegisterNext<'a> {
    fn split(self) -> Option<(&'a Arc<dyn Middleware>, Self)> {
        let (stage, rest) = self.rest.split_first()?;
        Some((
            stage,
            Self {
                rest,
                terminal: self.terminal,
            },
        ))
    }

    /// The command interface at the bottom of the chain.
    pub fn terminal(&self) -> &'a dyn CommandInterface {
        self.terminal
    }

    pub fn write(self, addr: RegisterAddr, value: RegisterValue) -> Result<WriteAck> {
        if let Some((stage, next)) = self.split() {
            return stage.write(addr, value, next);
        }
        let address = numeric(&addr)?;
        let confirmation = match value {
            RegisterValue::Raw(bytes) => self.terminal.write(address, &bytes)?,
            field => self.terminal.write(address, &field.as_word()?.to_le_bytes())?,
        };
        Ok(WriteAck {
            address,
            confirmation,
        })
    }

    pub fn read(self, addr: RegisterAddr) -> Result<RegisterValue> {
        if let Some((stage, next)) = self.split() {
            return stage.read(addr, next);
        }
        Ok(RegisterValue::Raw(self.terminal.read(numeric(&addr)?)?))
    }

    pub fn bulk_write(self, items: Vec<(RegisterAddr, RegisterValue)>) -> Vec<Result<WriteAck>> {
        if let Some((stage, next)) = self.split() {
            return stage.bulk_write(items, next);
        }
        let prepared: Vec<Result<(u32, Bytes)>> = items
            .into_iter()
            .map(|(addr, value)| {
                let address = numeric(&addr)?;
                let bytes = match value {
                    RegisterValue::Raw(bytes) => bytes,
                    field => Bytes::copy_from_slice(&field.as_word()?.to_le_bytes()),
                };
                Ok((address, bytes))
            })
            .collect();
        let valid: Vec<(u32, Bytes)> = prepared
            .iter()
            .filter_map(|item| item.as_ref().ok().cloned())
            .collect();
        let mut sent = self.terminal.bulk_write(&valid).into_iter();
        prepared
            .into_iter()
            .map(|item| {
                let (address, _) = item?;
                let confirmation = sent.next().unwrap_or_else(|| {
                    Err(KitError::Validation("transport returned too few results".into()))
                })?;
                Ok(WriteAck {
                    address,
                    confirmation,
                })
            })
            .collect()
    }

    pub fn bulk_read(self, addrs: Vec<RegisterAddr>) -> Vec<Result<RegisterValue>> {
        if let Some((stage, next)) = self.split() {
            return stage.bulk_read(addrs, next);
        }
        let prepared: Vec<Result<u32>> = addrs.iter().map(numeric).collect();
        let valid: Vec<u32> = prepared.iter().filter_map(|a| a.as_ref().ok().copied()).collect();
        let mut read = self.terminal.bulk_read(&valid).into_iter();
        prepared
            .into_iter()
            .map(|item| {
                item?;
                let bytes = read.next().unwrap_or_else(|| {
                    Err(KitError::Validation("transport returned too few results".into()))
                })?;
                Ok(RegisterValue::Raw(bytes))
            })
            .collect()
    }

    pub fn execute(self, command: &str, payload: &[u8]) -> Result<Bytes> {
        if let Some((stage, next)) = self.split() {
            return stage.execute(command, payload, next);
        }
        Err(KitError::Config(format!(
            "no middleware stage runs command {command:?}"
        )))
    }

    pub fn exchange(self, packet: Bytes, response_len: usize) -> Result<Bytes> {
        if let Some((stage, next)) = self.split() {
            return stage.exchange(packet, response_len, next);
        }
        self.terminal.exchange(&packet, response_len)
    }
}

fn numeric(addr: &RegisterAddr) -> Result<u32> {
    match addr {
        RegisterAddr::Numeric(address) => Ok(*address),
        // Nothing above resolved the name.
        RegisterAddr::Symbol(name) => Err(KitError::SchemaLookup(name.clone())),
    }
}

/// The rest of the chain below a stage, for stream operations.
///
/// Owned so that stages can hand it to their own threads.
#[derive(Clone)]
pub struct StreamNext {
    stages: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    terminal: Arc<dyn StreamInterface>,
}

impl StreamNext {
    fn stage(&self) -> Option<(&Arc<dyn Middleware>, Self)> {
        let stage = self.stages.get(self.index)?;
        Some((
            stage,
            Self {
                stages: Arc::clone(&self.stages),
                index: self.index + 1,
                terminal: Arc::clone(&self.terminal),
            },
        ))
    }

    pub fn terminal(&self) -> &Arc<dyn StreamInterface> {
        &self.terminal
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        self.terminal.resources()
    }

    pub fn send_open(&self, request: &TransferRequest) -> Result<TransferId> {
        match self.stage() {
            Some((stage, next)) => stage.send_open(request, &next),
            None => self.terminal.send_open(request),
        }
    }

    pub fn recv_open(&self, request: &TransferRequest) -> Result<TransferId> {
        match self.stage() {
            Some((stage, next)) => stage.recv_open(request, &next),
            None => self.terminal.recv_open(request),
        }
    }

    /// Descriptors live in the shared resource manager, so waiting needs no
    /// stage.
    pub fn wait_dma(&self, buffer: BufferId, timeout: Duration) -> Result<usize> {
        self.terminal.wait_dma(buffer, timeout)
    }

    pub fn break_dma(&self, buffer: BufferId) -> Result<()> {
        match self.stage() {
            Some((stage, next)) => stage.break_dma(buffer, &next),
            None => self.terminal.break_dma(buffer),
        }
    }
}

/// Ordered middleware stages.
#[derive(Clone, Default)]
pub struct Chain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages }
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    /// Stage names in traversal order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Entry point for register operations against `terminal`.
    pub fn register_entry<'a>(&'a self, terminal: &'a dyn CommandInterface) -> RegisterNext<'a> {
        RegisterNext {
            rest: &self.stages,
            terminal,
        }
    }

    /// Entry point for stream operations against `terminal`.
    pub fn stream_entry(&self, terminal: Arc<dyn StreamInterface>) -> StreamNext {
        StreamNext {
            stages: self.stages.clone().into(),
            index: 0,
            terminal,
        }
    }

    /// Let each stage start stream-side work. Stages attached before a
    /// failure are detached again.
    pub fn attach_stream(&self, entry: &StreamNext) -> Result<()> {
        for (index, stage) in self.stages.iter().enumerate() {
            let below = StreamNext {
                stages: Arc::clone(&entry.stages),
                index: index + 1,
                terminal: Arc::clone(&entry.terminal),
            };
            if let Err(err) = stage.attach_stream(&below) {
                for attached in self.stages[..index].iter().rev() {
                    attached.detach_stream();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn detach_stream(&self) {
        for stage in self.stages.iter().rev() {
            stage.detach_stream();
        }
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SimCommand;
    use std::sync::Mutex;

    /// Records the order it sees calls in, and offsets addresses on the way
    /// down.
    struct Tracer {
        label: &'static str,
        offset: u32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Tracer {
        fn name(&self) -> &'static str {
            self.label
        }

        fn read(&self, addr: RegisterAddr, next: RegisterNext<'_>) -> Result<RegisterValue> {
            self.log.lock().unwrap().push(format!("{} down", self.label));
            let addr = match addr {
                RegisterAddr::Numeric(a) => RegisterAddr::Numeric(a + self.offset),
                other => other,
            };
            let value = next.read(addr);
            self.log.lock().unwrap().push(format!("{} up", self.label));
            value
        }
    }

    #[test]
    fn responses_unwind_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            Arc::new(Tracer {
                label: "a",
                offset: 0x10,
                log: Arc::clone(&log),
            }),
            Arc::new(Tracer {
                label: "b",
                offset: 0x4,
                log: Arc::clone(&log),
            }),
        ]);
        let sim = SimCommand::new();
        sim.open(&"sim://chain".parse().unwrap()).unwrap();
        sim.poke(0x14, 42);

        let value = chain.register_entry(&sim).read(RegisterAddr::Numeric(0)).unwrap();
        assert_eq!(value.as_word().unwrap(), 42);
        assert_eq!(*log.lock().unwrap(), vec!["a down", "b down", "b up", "a up"]);
        assert_eq!(chain.names(), vec!["a", "b"]);
    }

    #[test]
    fn unresolved_symbol_fails_before_wire() {
        let sim = SimCommand::new();
        sim.open(&"sim://chain".parse().unwrap()).unwrap();
        let chain = Chain::default();
        let err = chain
            .register_entry(&sim)
            .write("STATUS".into(), RegisterValue::from(1i64))
            .unwrap_err();
        assert!(matches!(err, KitError::SchemaLookup(name) if name == "STATUS"));
        assert_eq!(sim.operations(), 0);
    }

    #[test]
    fn bulk_read_keeps_positions() {
        let sim = SimCommand::new();
        sim.open(&"sim://chain".parse().unwrap()).unwrap();
        sim.poke(0x0, 1);
        sim.poke(0x8, 3);
        sim.fail_address(0x4);
        let chain = Chain::default();

        let results = chain.register_entry(&sim).bulk_read(vec![
            RegisterAddr::Numeric(0x0),
            RegisterAddr::Symbol("NOPE".into()),
            RegisterAddr::Numeric(0x4),
            RegisterAddr::Numeric(0x8),
        ]);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().as_word().unwrap(), 1);
        assert!(matches!(results[1], Err(KitError::SchemaLookup(_))));
        assert_eq!(results[2].as_ref().unwrap_err().kind(), "transport");
        assert_eq!(results[3].as_ref().unwrap().as_word().unwrap(), 3);
    }

    #[test]
    fn execute_needs_a_stage_that_runs_it() {
        let sim = SimCommand::new();
        sim.open(&"sim://chain".parse().unwrap()).unwrap();
        let chain = Chain::default();
        let err = chain.register_entry(&sim).execute("tune", &[]).unwrap_err();
        assert_eq!(err.kind(), "config");

        let reply = chain
            .register_entry(&sim)
            .exchange(Bytes::from_static(&[0; 16]), 16)
            .unwrap();
        assert_eq!(reply.len(), 16);
        assert_eq!(sim.operations(), 1);
    }

    #[test]
    fn raw_values_display_as_words() {
        let value = RegisterValue::Raw(Bytes::from_static(&[5, 0, 0, 0]));
        assert_eq!(value.to_string(), "0x00000005");
        assert!(word_from_bytes(&[0; 5]).is_err());
    }
}
