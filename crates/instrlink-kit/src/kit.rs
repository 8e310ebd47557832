//! The kit facade.
//!
//! One [`Kit`] talks to one device. It owns the buffer table, the
//! middleware chain, and at most one command and one stream interface,
//! and routes each call to the right one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use instrlink_frame::BlockMode;
use instrlink_schema::{CommandSet, ParamValue, RegisterSchema};
use tracing::{debug, info, warn};

use crate::command::{BulkSemantics, CommandInterface};
use crate::config::{InterfaceConfig, KitConfig};
use crate::error::{KitError, Result};
use crate::middleware::schema::SharedCommandSet;
use crate::middleware::{Chain, RegisterAddr, RegisterValue, StreamNext, WriteAck};
use crate::registry::{MiddlewareContext, MiddlewareRegistry, StreamSetup, TransportRegistry};
use crate::resource::{
    BufferId, BufferView, Channel, Direction, ResourceManager, TransferId, TransferRequest,
};
use crate::stream::looping::{run_loop, StreamTask};
use crate::stream::{LoopMode, LoopSpec, StopSignal, StreamInterface, StreamSummary};

/// Handle of a background streaming loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTaskId(u64);

impl StreamTaskId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Outcome of starting a streaming loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRun {
    /// A blocking loop ran to its end.
    Finished(StreamSummary),
    /// A background loop is running; collect it with [`Kit::join_stream`].
    Background(StreamTaskId),
}

struct ActiveStream {
    interface: Arc<dyn StreamInterface>,
    entry: StreamNext,
}

/// Register and streaming access to one device.
pub struct Kit {
    config: KitConfig,
    transports: TransportRegistry,
    middleware: MiddlewareRegistry,
    resources: Arc<ResourceManager>,
    schema: Option<Arc<RegisterSchema>>,
    commands: Option<SharedCommandSet>,
    chain: Option<Arc<Chain>>,
    command: Option<Arc<dyn CommandInterface>>,
    stream: Option<ActiveStream>,
    tasks: Mutex<HashMap<StreamTaskId, StreamTask>>,
    next_task: AtomicU64,
}

impl Kit {
    /// A kit using the built-in transports and middleware.
    pub fn new(config: KitConfig) -> Result<Self> {
        Self::with_registries(
            config,
            TransportRegistry::with_builtins(),
            MiddlewareRegistry::with_builtins(),
        )
    }

    pub fn with_registries(
        config: KitConfig,
        transports: TransportRegistry,
        middleware: MiddlewareRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let resources = Arc::new(ResourceManager::new(config.resources.pool_bytes));
        Ok(Self {
            config,
            transports,
            middleware,
            resources,
            schema: None,
            commands: None,
            chain: None,
            command: None,
            stream: None,
            tasks: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &KitConfig {
        &self.config
    }

    /// The kit's buffer table.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// The schema the chain was built with, once a start call built it.
    pub fn schema(&self) -> Option<&RegisterSchema> {
        self.schema.as_deref()
    }

    /// Middleware names in traversal order, once the chain exists.
    pub fn chain_names(&self) -> Vec<&'static str> {
        self.chain.as_ref().map(|chain| chain.names()).unwrap_or_default()
    }

    pub fn is_command_started(&self) -> bool {
        self.command.is_some()
    }

    pub fn is_stream_started(&self) -> bool {
        self.stream.is_some()
    }

    fn ensure_chain(&mut self) -> Result<Arc<Chain>> {
        if let Some(chain) = &self.chain {
            return Ok(Arc::clone(chain));
        }
        let schema = self.config.load_schema()?;
        let commands: SharedCommandSet = Arc::new(Mutex::new(self.config.load_commands()?));
        let ctx = MiddlewareContext {
            config: &self.config,
            schema: Arc::clone(&schema),
            commands: Arc::clone(&commands),
        };
        let chain = Arc::new(self.middleware.build_chain(&self.config.middleware, &ctx)?);
        info!(stages = ?chain.names(), registers = schema.len(), "middleware chain ready");
        self.schema = Some(schema);
        self.commands = Some(commands);
        self.chain = Some(Arc::clone(&chain));
        Ok(chain)
    }

    fn release_chain_if_idle(&mut self) {
        if self.command.is_none() && self.stream.is_none() {
            self.chain = None;
            self.schema = None;
            self.commands = None;
        }
    }

    // Command side.

    /// Open the configured command interface.
    pub fn start_command(&mut self) -> Result<()> {
        let section = self
            .config
            .command
            .clone()
            .ok_or_else(|| KitError::Config("no command section configured".into()))?;
        self.start_command_with(section)
    }

    /// Open a command interface on `target`, choosing the transport from
    /// its scheme. Timeout and address limit come from the configured
    /// command section when it names the same transport.
    pub fn start_command_at(&mut self, target: &str) -> Result<()> {
        let section = merge_section(InterfaceConfig::for_target(target)?, self.config.command.as_ref());
        self.start_command_with(section)
    }

    fn start_command_with(&mut self, section: InterfaceConfig) -> Result<()> {
        if let Some(previous) = self.command.take() {
            previous.close()?;
        }
        let target = section.target()?;
        let command = self.transports.create_command(&section)?;
        command.open(&target)?;
        if let Err(err) = self.ensure_chain() {
            command.close()?;
            return Err(err);
        }
        info!(transport = command.name(), %target, "command interface started");
        self.command = Some(command);
        Ok(())
    }

    /// Close the command interface.
    ///
    /// The chain is shared with the stream side, so an active stream is
    /// stopped first and its pending transfers are cancelled.
    pub fn stop_command(&mut self) -> Result<()> {
        if self.command.is_none() {
            return Ok(());
        }
        self.stop_stream()?;
        if let Some(command) = self.command.take() {
            command.close()?;
            info!(transport = command.name(), "command interface stopped");
        }
        self.release_chain_if_idle();
        Ok(())
    }

    fn command_side(&self) -> Result<(&Chain, &dyn CommandInterface)> {
        match (&self.chain, &self.command) {
            (Some(chain), Some(command)) => Ok((chain.as_ref(), command.as_ref())),
            _ => Err(KitError::NotStarted("command")),
        }
    }

    /// Write a register by name or address.
    pub fn write(
        &self,
        addr: impl Into<RegisterAddr>,
        value: impl Into<RegisterValue>,
    ) -> Result<WriteAck> {
        let (chain, command) = self.command_side()?;
        chain.register_entry(command).write(addr.into(), value.into())
    }

    /// Read a register by name or address. Named fields come back decoded.
    pub fn read(&self, addr: impl Into<RegisterAddr>) -> Result<RegisterValue> {
        let (chain, command) = self.command_side()?;
        chain.register_entry(command).read(addr.into())
    }

    /// Write several registers. One result per element, in input order.
    pub fn bulk_write<A, V>(
        &self,
        items: impl IntoIterator<Item = (A, V)>,
    ) -> Result<Vec<Result<WriteAck>>>
    where
        A: Into<RegisterAddr>,
        V: Into<RegisterValue>,
    {
        let (chain, command) = self.command_side()?;
        let items = items
            .into_iter()
            .map(|(addr, value)| (addr.into(), value.into()))
            .collect();
        let results = chain.register_entry(command).bulk_write(items);
        Ok(settle_batch(command.bulk_semantics(), results))
    }

    /// Read several registers. One result per element, in input order.
    pub fn bulk_read<A: Into<RegisterAddr>>(
        &self,
        addrs: impl IntoIterator<Item = A>,
    ) -> Result<Vec<Result<RegisterValue>>> {
        let (chain, command) = self.command_side()?;
        let addrs = addrs.into_iter().map(Into::into).collect();
        let results = chain.register_entry(command).bulk_read(addrs);
        Ok(settle_batch(command.bulk_semantics(), results))
    }

    /// Write raw words starting at a numeric base address.
    pub fn block_write(&self, base: u32, data: &[u8], mode: BlockMode) -> Result<()> {
        let (_, command) = self.command_side()?;
        command.block_write(base, data, mode)
    }

    /// Read raw words starting at a numeric base address.
    pub fn block_read(&self, base: u32, length: usize, mode: BlockMode) -> Result<Bytes> {
        let (_, command) = self.command_side()?;
        command.block_read(base, length, mode)
    }

    /// Write every documented reset value in the schema. Returns how many
    /// fields were written.
    pub fn apply_defaults(&self) -> Result<usize> {
        let (chain, command) = self.command_side()?;
        let Some(schema) = &self.schema else {
            return Ok(0);
        };
        let mut written = 0;
        for def in schema.iter() {
            if let Some(value) = &def.default {
                chain
                    .register_entry(command)
                    .write(RegisterAddr::from(def.name.as_str()), value.clone().into())?;
                written += 1;
            }
        }
        debug!(written, "schema defaults applied");
        Ok(written)
    }

    fn command_set(&self) -> Result<MutexGuard<'_, CommandSet>> {
        self.command_side()?;
        let commands = self.commands.as_ref().ok_or(KitError::NotStarted("command"))?;
        Ok(commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Set a parameter in the command table. Nothing is sent until a
    /// command carrying it runs.
    pub fn set_param(&self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        Ok(self.command_set()?.set_param(name, value)?)
    }

    /// Current value of a parameter, as last set or last reported by the
    /// device.
    pub fn get_param(&self, name: &str) -> Result<ParamValue> {
        Ok(self.command_set()?.get_param(name)?)
    }

    /// Parameters in name order.
    pub fn params(&self) -> Result<Vec<(String, ParamValue)>> {
        Ok(self
            .command_set()?
            .params()
            .map(|(name, param)| (name.to_string(), param.value.clone()))
            .collect())
    }

    /// Run a named command with no payload.
    pub fn execute(&self, command: &str) -> Result<Bytes> {
        self.execute_with(command, &[])
    }

    /// Run a named command carrying `payload`. Returns the raw response;
    /// parameters it reports are stored in the table.
    pub fn execute_with(&self, command: &str, payload: &[u8]) -> Result<Bytes> {
        let (chain, interface) = self.command_side()?;
        chain.register_entry(interface).execute(command, payload)
    }

    /// Run `name` if it is a command, otherwise every command that sends
    /// parameter `name`. Returns the commands run.
    pub fn execute_for(&self, name: &str) -> Result<Vec<String>> {
        let commands: Vec<String> = self
            .command_set()?
            .commands_for(name)
            .into_iter()
            .map(str::to_string)
            .collect();
        if commands.is_empty() {
            return Err(KitError::SchemaLookup(name.to_string()));
        }
        for command in &commands {
            self.execute(command)?;
        }
        Ok(commands)
    }

    // Stream side.

    /// Open the configured stream interface and attach the chain to it.
    pub fn start_stream(&mut self) -> Result<()> {
        let section = self
            .config
            .stream
            .clone()
            .ok_or_else(|| KitError::Config("no stream section configured".into()))?;
        self.start_stream_with(section)
    }

    /// Open a stream interface on `target`, choosing the transport from
    /// its scheme.
    pub fn start_stream_at(&mut self, target: &str) -> Result<()> {
        let section = merge_section(InterfaceConfig::for_target(target)?, self.config.stream.as_ref());
        self.start_stream_with(section)
    }

    fn start_stream_with(&mut self, section: InterfaceConfig) -> Result<()> {
        self.stop_stream()?;
        let target = section.target()?;
        let interface = self.transports.create_stream(&StreamSetup {
            interface: &section,
            resources: Arc::clone(&self.resources),
            poll: self.config.streaming.poll_interval(),
        })?;
        interface.open(&target)?;

        let chain = match self.ensure_chain() {
            Ok(chain) => chain,
            Err(err) => {
                interface.close()?;
                return Err(err);
            }
        };
        let entry = chain.stream_entry(Arc::clone(&interface));
        if let Err(err) = chain.attach_stream(&entry) {
            interface.close()?;
            self.release_chain_if_idle();
            return Err(err);
        }
        info!(transport = interface.name(), %target, "stream interface started");
        self.stream = Some(ActiveStream { interface, entry });
        Ok(())
    }

    /// Stop every streaming loop, cancel pending transfers, detach the chain
    /// and close the stream interface. Buffers stay allocated.
    pub fn stop_stream(&mut self) -> Result<()> {
        let Some(active) = self.stream.take() else {
            return Ok(());
        };
        let tasks: Vec<(StreamTaskId, StreamTask)> = self.lock_tasks().drain().collect();
        for (_, task) in &tasks {
            task.stop();
        }
        active.interface.cancel_all();
        for (id, task) in tasks {
            match task.join() {
                Ok(summary) => debug!(%id, transfers = summary.transfers, "stream loop joined"),
                Err(err) => warn!(%id, error = %err, "stream loop ended with error"),
            }
        }
        if let Some(chain) = &self.chain {
            chain.detach_stream();
        }
        active.interface.close()?;
        info!(transport = active.interface.name(), "stream interface stopped");
        self.release_chain_if_idle();
        Ok(())
    }

    fn stream_side(&self) -> Result<&StreamNext> {
        self.stream
            .as_ref()
            .map(|active| &active.entry)
            .ok_or(KitError::NotStarted("stream"))
    }

    pub fn alloc_buffer(&self, length: usize) -> Result<BufferId> {
        self.resources.alloc(length)
    }

    pub fn free_buffer(&self, buffer: BufferId) -> Result<()> {
        self.resources.free(buffer)
    }

    pub fn get_buffer(&self, buffer: BufferId, length: usize) -> Result<BufferView> {
        self.resources.get_buffer(buffer, length)
    }

    /// Start sending `length` bytes at `offset` of `buffer` on a logical channel.
    pub fn send_open(
        &self,
        channel: u16,
        buffer: BufferId,
        length: usize,
        offset: usize,
    ) -> Result<TransferId> {
        let request =
            TransferRequest::new(Channel::Logical(channel), buffer, length).at_offset(offset);
        self.stream_side()?.send_open(&request)
    }

    /// Start receiving `length` bytes into `buffer` at `offset` from a
    /// logical channel.
    pub fn recv_open(
        &self,
        channel: u16,
        buffer: BufferId,
        length: usize,
        offset: usize,
    ) -> Result<TransferId> {
        let request =
            TransferRequest::new(Channel::Logical(channel), buffer, length).at_offset(offset);
        self.stream_side()?.recv_open(&request)
    }

    /// Wait for the latest transfer on `buffer`. A zero timeout polls.
    pub fn wait_dma(&self, buffer: BufferId, timeout: Duration) -> Result<usize> {
        self.resources.wait(buffer, timeout)
    }

    /// Cancel the pending transfer on `buffer`. Repeating it is a no-op.
    pub fn break_dma(&self, buffer: BufferId) -> Result<()> {
        match &self.stream {
            Some(active) => active.entry.break_dma(buffer),
            None => self.resources.cancel(buffer).map(|_| ()),
        }
    }

    /// Send the same buffer region over and over.
    pub fn stream_send(&self, spec: LoopSpec, stop: StopSignal, mode: LoopMode) -> Result<StreamRun> {
        self.stream_loop(Direction::Send, spec, stop, mode)
    }

    /// Receive into the same buffer region over and over.
    pub fn stream_recv(&self, spec: LoopSpec, stop: StopSignal, mode: LoopMode) -> Result<StreamRun> {
        self.stream_loop(Direction::Recv, spec, stop, mode)
    }

    fn stream_loop(
        &self,
        direction: Direction,
        spec: LoopSpec,
        stop: StopSignal,
        mode: LoopMode,
    ) -> Result<StreamRun> {
        let entry = self.stream_side()?;
        match mode {
            LoopMode::Blocking => Ok(StreamRun::Finished(run_loop(entry, direction, spec, &stop)?)),
            LoopMode::Background => {
                let id = StreamTaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
                let task = StreamTask::spawn(
                    format!("instrlink-stream-{}", id.raw()),
                    entry.clone(),
                    direction,
                    spec,
                    stop,
                )?;
                self.lock_tasks().insert(id, task);
                debug!(%id, %direction, "background stream loop started");
                Ok(StreamRun::Background(id))
            }
        }
    }

    /// Wait for a background loop and return its summary.
    pub fn join_stream(&self, id: StreamTaskId) -> Result<StreamSummary> {
        let task = self
            .lock_tasks()
            .remove(&id)
            .ok_or_else(|| KitError::Validation(format!("unknown stream loop {id}")))?;
        task.join()
    }

    /// Background loops not yet joined.
    pub fn active_streams(&self) -> Vec<StreamTaskId> {
        let mut ids: Vec<StreamTaskId> = self.lock_tasks().keys().copied().collect();
        ids.sort();
        ids
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<StreamTaskId, StreamTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Kit {
    fn drop(&mut self) {
        if let Err(err) = self.stop_command() {
            warn!(error = %err, "command shutdown failed");
        }
        if let Err(err) = self.stop_stream() {
            warn!(error = %err, "stream shutdown failed");
        }
    }
}

impl fmt::Debug for Kit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kit")
            .field("command", &self.command.as_ref().map(|c| c.name()))
            .field("stream", &self.stream.as_ref().map(|s| s.interface.name()))
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

fn merge_section(mut section: InterfaceConfig, configured: Option<&InterfaceConfig>) -> InterfaceConfig {
    if let Some(configured) = configured.filter(|c| c.transport == section.transport) {
        section.timeout_ms = configured.timeout_ms;
        section.address_limit = configured.address_limit;
    }
    section
}

/// Apply the transport's batch rule: under all-or-nothing, one failure
/// turns every success in the batch into [`KitError::BatchAborted`].
fn settle_batch<T>(semantics: BulkSemantics, results: Vec<Result<T>>) -> Vec<Result<T>> {
    if semantics == BulkSemantics::PerElement {
        return results;
    }
    let Some(reason) = results
        .iter()
        .enumerate()
        .find_map(|(index, result)| result.as_ref().err().map(|err| format!("element {index}: {err}")))
    else {
        return results;
    };
    results
        .into_iter()
        .map(|result| result.and_then(|_| Err(KitError::BatchAborted(reason.clone()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_kit() -> Kit {
        let config = KitConfig::from_json_str(
            r#"{
                "command": {"transport": "sim", "target": "sim://bench"},
                "stream": {"transport": "sim", "target": "sim://bench"},
                "schema": {"inline": {"registers": [
                    {"name": "STATUS", "address": "0x10", "bit_width": 8, "default": 3}
                ]}}
            }"#,
        )
        .unwrap();
        Kit::new(config).unwrap()
    }

    #[test]
    fn operations_need_their_start_call() {
        let kit = sim_kit();
        assert!(matches!(kit.read(0x10u32), Err(KitError::NotStarted("command"))));
        let buf = kit.alloc_buffer(8).unwrap();
        assert!(matches!(
            kit.recv_open(0, buf, 8, 0),
            Err(KitError::NotStarted("stream"))
        ));
    }

    #[test]
    fn chain_lives_while_either_side_is_started() {
        let mut kit = sim_kit();
        kit.start_command().unwrap();
        kit.start_stream().unwrap();
        assert_eq!(kit.chain_names(), vec!["schema", "virtual-channel"]);

        kit.stop_stream().unwrap();
        assert_eq!(kit.chain_names().len(), 2);
        kit.stop_command().unwrap();
        assert!(kit.chain_names().is_empty());
        assert!(kit.schema().is_none());
    }

    #[test]
    fn stop_command_also_stops_stream() {
        let mut kit = sim_kit();
        kit.start_command().unwrap();
        kit.start_stream().unwrap();
        let buf = kit.alloc_buffer(4).unwrap();
        kit.recv_open(0, buf, 4, 0).unwrap();

        kit.stop_command().unwrap();
        assert!(!kit.is_stream_started());
        assert!(matches!(
            kit.wait_dma(buf, Duration::ZERO),
            Err(KitError::Cancelled(_))
        ));
        kit.free_buffer(buf).unwrap();
    }

    #[test]
    fn defaults_written_by_name() {
        let mut kit = sim_kit();
        kit.start_command().unwrap();
        assert_eq!(kit.apply_defaults().unwrap(), 1);
        assert_eq!(kit.read("STATUS").unwrap(), RegisterValue::from(3i64));
    }

    #[test]
    fn params_and_commands_through_the_kit() {
        let config = KitConfig::from_json_str(
            r#"{
                "command": {"transport": "sim", "target": "sim://bench"},
                "icd": {"document": {"inline": {
                    "param": {"freq": ["double", 1.0e9], "locked": ["uint32", 0]},
                    "command": {"tune": {
                        "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x31000001"], ["uint32", 4],
                                 ["uint32", 0], "freq"],
                        "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x31000001"], ["uint32", 4],
                                 ["uint32", 0], ["uint32", 0], "locked"]
                    }}
                }}}
            }"#,
        )
        .unwrap();
        let mut kit = Kit::new(config).unwrap();
        assert!(matches!(kit.get_param("freq"), Err(KitError::NotStarted("command"))));
        kit.start_command().unwrap();

        kit.set_param("freq", "2.5e9").unwrap();
        assert_eq!(kit.get_param("freq").unwrap(), ParamValue::Float(2.5e9));
        kit.set_param("locked", 9i64).unwrap();

        // The simulated device acknowledges with zeros, which the reply
        // layout stores into `locked`.
        let reply = kit.execute("tune").unwrap();
        assert_eq!(reply.len(), 24);
        assert_eq!(kit.get_param("locked").unwrap(), ParamValue::Int(0));

        assert_eq!(kit.execute_for("freq").unwrap(), vec!["tune"]);
        assert_eq!(kit.params().unwrap().len(), 2);
        assert_eq!(kit.get_param("nope").unwrap_err().kind(), "schema_lookup");
        assert_eq!(kit.execute("nope").unwrap_err().kind(), "schema_lookup");
        assert_eq!(kit.execute_for("nope").unwrap_err().kind(), "schema_lookup");
    }

    #[test]
    fn start_at_target_without_sections() {
        let mut kit = Kit::new(KitConfig::default()).unwrap();
        assert_eq!(kit.start_command().unwrap_err().kind(), "config");
        kit.start_command_at("sim://elsewhere").unwrap();
        kit.write(0x20u32, 7i64).unwrap();
        assert_eq!(kit.read(0x20u32).unwrap().as_word().unwrap(), 7);
    }

    #[test]
    fn join_unknown_stream_loop() {
        let kit = sim_kit();
        assert_eq!(kit.join_stream(StreamTaskId(99)).unwrap_err().kind(), "validation");
    }

    #[test]
    fn all_or_nothing_aborts_siblings() {
        let results: Vec<Result<u32>> = vec![Ok(1), Err(KitError::Validation("bad".into())), Ok(3)];
        let settled = settle_batch(BulkSemantics::AllOrNothing, results);
        assert_eq!(settled[0].as_ref().unwrap_err().kind(), "batch_aborted");
        assert_eq!(settled[1].as_ref().unwrap_err().kind(), "validation");
        assert_eq!(settled[2].as_ref().unwrap_err().kind(), "batch_aborted");

        let results: Vec<Result<u32>> = vec![Ok(1), Err(KitError::Validation("bad".into()))];
        let settled = settle_batch(BulkSemantics::PerElement, results);
        assert_eq!(*settled[0].as_ref().unwrap(), 1);
    }
}
