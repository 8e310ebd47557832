//! Name-keyed constructors for transports and middleware.
//!
//! Configuration names a transport and a list of middleware by string.
//! The registries turn those names into live objects. Both are filled
//! explicitly: [`TransportRegistry::with_builtins`] and
//! [`MiddlewareRegistry::with_builtins`] register what ships with the kit,
//! and callers may add their own.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use instrlink_schema::RegisterSchema;
use instrlink_transport::PcieDriver;
use tracing::debug;

use crate::command::{CommandInterface, PcieCommand, SimCommand, TcpCommand};
use crate::config::{InterfaceConfig, KitConfig};
use crate::error::{KitError, Result};
use crate::middleware::schema::{SchemaRegisterMiddleware, SharedCommandSet};
use crate::middleware::virtual_channel::VirtualChannelMiddleware;
use crate::middleware::{Chain, Middleware};
use crate::resource::ResourceManager;
use crate::stream::{DmaStream, LoopbackEngine, PcieEngine, StreamInterface, TcpEngine};

/// What a stream constructor gets to work with.
pub struct StreamSetup<'a> {
    pub interface: &'a InterfaceConfig,
    /// The kit's buffer table; the interface must allocate from it.
    pub resources: Arc<ResourceManager>,
    /// Polling slice for engine worker threads.
    pub poll: Duration,
}

pub type CommandFactory =
    Box<dyn Fn(&InterfaceConfig) -> Result<Arc<dyn CommandInterface>> + Send + Sync>;

pub type StreamFactory =
    Box<dyn Fn(&StreamSetup<'_>) -> Result<Arc<dyn StreamInterface>> + Send + Sync>;

/// Transport name to interface constructors.
///
/// A transport may provide a command side, a stream side, or both.
#[derive(Default)]
pub struct TransportRegistry {
    command: BTreeMap<String, CommandFactory>,
    stream: BTreeMap<String, StreamFactory>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `tcp` (command and stream), `serial` (command, with the `serial`
    /// feature) and `sim` (command and stream).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_command("tcp", |cfg: &InterfaceConfig| {
            let command = TcpCommand::new(cfg.timeout()).with_address_limit(cfg.address_limit);
            Ok(Arc::new(command) as Arc<dyn CommandInterface>)
        });
        registry.register_stream("tcp", |setup: &StreamSetup<'_>| {
            let stream = DmaStream::new(TcpEngine::new(setup.poll), Arc::clone(&setup.resources));
            Ok(Arc::new(stream) as Arc<dyn StreamInterface>)
        });
        #[cfg(feature = "serial")]
        registry.register_command("serial", |cfg: &InterfaceConfig| {
            let command = crate::command::SerialCommand::new(cfg.timeout())
                .with_address_limit(cfg.address_limit);
            Ok(Arc::new(command) as Arc<dyn CommandInterface>)
        });
        registry.register_command("sim", |cfg: &InterfaceConfig| {
            let command = match cfg.address_limit {
                Some(limit) => SimCommand::new().with_address_limit(limit),
                None => SimCommand::new(),
            };
            Ok(Arc::new(command) as Arc<dyn CommandInterface>)
        });
        registry.register_stream("sim", |setup: &StreamSetup<'_>| {
            let stream = DmaStream::new(LoopbackEngine::new(), Arc::clone(&setup.resources));
            Ok(Arc::new(stream) as Arc<dyn StreamInterface>)
        });
        registry
    }

    /// Register `pcie` on both sides, backed by `driver`.
    pub fn with_pcie_driver(mut self, driver: Arc<dyn PcieDriver>) -> Self {
        let command_driver = Arc::clone(&driver);
        self.register_command("pcie", move |cfg: &InterfaceConfig| {
            let command =
                PcieCommand::new(Arc::clone(&command_driver)).with_address_limit(cfg.address_limit);
            Ok(Arc::new(command) as Arc<dyn CommandInterface>)
        });
        self.register_stream("pcie", move |setup: &StreamSetup<'_>| {
            let stream = DmaStream::new(
                PcieEngine::new(Arc::clone(&driver)),
                Arc::clone(&setup.resources),
            );
            Ok(Arc::new(stream) as Arc<dyn StreamInterface>)
        });
        self
    }

    /// Add or replace a command constructor.
    pub fn register_command(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&InterfaceConfig) -> Result<Arc<dyn CommandInterface>> + Send + Sync + 'static,
    ) {
        self.command.insert(name.into(), Box::new(factory));
    }

    /// Add or replace a stream constructor.
    pub fn register_stream(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&StreamSetup<'_>) -> Result<Arc<dyn StreamInterface>> + Send + Sync + 'static,
    ) {
        self.stream.insert(name.into(), Box::new(factory));
    }

    pub fn create_command(&self, cfg: &InterfaceConfig) -> Result<Arc<dyn CommandInterface>> {
        let factory = self.command.get(&cfg.transport).ok_or_else(|| {
            KitError::Config(format!(
                "transport {:?} has no command interface (known: {})",
                cfg.transport,
                join_names(self.command.keys())
            ))
        })?;
        debug!(transport = %cfg.transport, "creating command interface");
        factory(cfg)
    }

    pub fn create_stream(&self, setup: &StreamSetup<'_>) -> Result<Arc<dyn StreamInterface>> {
        let name = &setup.interface.transport;
        let factory = self.stream.get(name).ok_or_else(|| {
            KitError::Config(format!(
                "transport {name:?} has no stream interface (known: {})",
                join_names(self.stream.keys())
            ))
        })?;
        debug!(transport = %name, "creating stream interface");
        factory(setup)
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.command.keys().map(String::as_str).collect()
    }

    pub fn stream_names(&self) -> Vec<&str> {
        self.stream.keys().map(String::as_str).collect()
    }
}

fn join_names<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let names: Vec<&str> = names.map(String::as_str).collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// What a middleware constructor gets to work with.
pub struct MiddlewareContext<'a> {
    pub config: &'a KitConfig,
    /// The configured schema, loaded once per chain.
    pub schema: Arc<RegisterSchema>,
    /// The configured parameter table, shared with the kit.
    pub commands: SharedCommandSet,
}

pub type MiddlewareFactory =
    Box<dyn Fn(&MiddlewareContext<'_>) -> Result<Arc<dyn Middleware>> + Send + Sync>;

/// Middleware name to constructor.
#[derive(Default)]
pub struct MiddlewareRegistry {
    factories: BTreeMap<String, MiddlewareFactory>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `schema` and `virtual-channel`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("schema", |ctx: &MiddlewareContext<'_>| {
            let stage = SchemaRegisterMiddleware::new(Arc::clone(&ctx.schema)).with_commands(
                Arc::clone(&ctx.commands),
                ctx.config.check_response_header(),
            );
            Ok(Arc::new(stage) as Arc<dyn Middleware>)
        });
        registry.register("virtual-channel", |ctx: &MiddlewareContext<'_>| {
            let vc = &ctx.config.virtual_channels;
            let stage = if vc.enabled {
                VirtualChannelMiddleware::new(
                    vc.table()?,
                    vc.options(ctx.config.streaming.poll_interval()),
                )
            } else {
                VirtualChannelMiddleware::disabled()
            };
            Ok(Arc::new(stage) as Arc<dyn Middleware>)
        });
        registry
    }

    /// Add or replace a constructor.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&MiddlewareContext<'_>) -> Result<Arc<dyn Middleware>> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn create(&self, name: &str, ctx: &MiddlewareContext<'_>) -> Result<Arc<dyn Middleware>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            KitError::Config(format!(
                "unknown middleware {name:?} (known: {})",
                join_names(self.factories.keys())
            ))
        })?;
        factory(ctx)
    }

    /// Build a chain from `names`, outermost first.
    pub fn build_chain<S: AsRef<str>>(&self, names: &[S], ctx: &MiddlewareContext<'_>) -> Result<Chain> {
        let stages = names
            .iter()
            .map(|name| self.create(name.as_ref(), ctx))
            .collect::<Result<Vec<_>>>()?;
        let chain = Chain::new(stages);
        debug!(stages = ?chain.names(), "middleware chain built");
        Ok(chain)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
