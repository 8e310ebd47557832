//! Kit configuration.
//!
//! Loaded from JSON. Every section rejects keys it does not know, so a
//! misspelled option fails at load time instead of being ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use instrlink_frame::{DEFAULT_PHYSICAL_CHANNEL, MAX_VIRTUAL_CHANNELS};
use instrlink_schema::{CommandSet, RegisterSchema, RegistryConfig};
use instrlink_transport::Target;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KitError, Result};
use crate::middleware::virtual_channel::{
    ChannelRoute, VirtualChannelOptions, VirtualChannelTable,
};

/// Default timeout for command exchanges and link setup.
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Default buffer pool size: 256 MiB.
pub const DEFAULT_POOL_BYTES: usize = 256 * 1024 * 1024;

/// Default longest single wait inside streaming loops.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default largest payload carried in one virtual channel frame.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KitConfig {
    /// Register access link.
    #[serde(default)]
    pub command: Option<InterfaceConfig>,
    /// Streaming link.
    #[serde(default)]
    pub stream: Option<InterfaceConfig>,
    #[serde(default)]
    pub virtual_channels: VirtualChannelConfig,
    /// Where register names come from.
    #[serde(default)]
    pub schema: Option<SchemaSource>,
    /// Parameter table and command packets.
    #[serde(default)]
    pub icd: Option<IcdConfig>,
    /// Middleware names, outermost first.
    #[serde(default = "default_middleware")]
    pub middleware: Vec<String>,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            command: None,
            stream: None,
            virtual_channels: VirtualChannelConfig::default(),
            schema: None,
            icd: None,
            middleware: default_middleware(),
            resources: ResourceConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

fn default_middleware() -> Vec<String> {
    vec!["schema".to_string(), "virtual-channel".to_string()]
}

/// One interface: which transport, and where the device is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    /// Registered transport name; must equal the target's scheme.
    pub transport: String,
    /// Endpoint, e.g. `tcp://192.168.1.152:5001`.
    pub target: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Highest register byte address the device accepts.
    #[serde(default)]
    pub address_limit: Option<u32>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl InterfaceConfig {
    /// Section for `target`, with the transport taken from its scheme.
    pub fn for_target(target: &str) -> Result<Self> {
        let parsed = parse_target(target)?;
        Ok(Self {
            transport: parsed.scheme().to_string(),
            target: target.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            address_limit: None,
        })
    }

    pub fn target(&self) -> Result<Target> {
        parse_target(&self.target)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        let target = self.target()?;
        if target.scheme() != self.transport {
            return Err(KitError::Config(format!(
                "{section}: transport {:?} does not match target {}",
                self.transport, self.target
            )));
        }
        if self.timeout_ms == 0 {
            return Err(KitError::Config(format!("{section}: timeout_ms must be positive")));
        }
        Ok(())
    }
}

fn parse_target(target: &str) -> Result<Target> {
    target
        .parse()
        .map_err(|err| KitError::Config(format!("{err}")))
}

/// Virtual channel multiplexing on the stream side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_physical_channel")]
    pub physical_channel: u16,
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: usize,
    /// Logical channel to tag table. Empty means logical `n` uses tag `n`
    /// for every supported channel.
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

impl Default for VirtualChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            physical_channel: DEFAULT_PHYSICAL_CHANNEL,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            channels: Vec::new(),
        }
    }
}

fn default_physical_channel() -> u16 {
    DEFAULT_PHYSICAL_CHANNEL
}

fn default_max_frame_payload() -> usize {
    DEFAULT_MAX_FRAME_PAYLOAD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelEntry {
    pub logical: u16,
    pub tag: u16,
}

impl VirtualChannelConfig {
    pub fn table(&self) -> Result<VirtualChannelTable> {
        if self.channels.is_empty() {
            return VirtualChannelTable::identity(MAX_VIRTUAL_CHANNELS as u16);
        }
        VirtualChannelTable::new(self.channels.iter().map(|entry| ChannelRoute {
            logical: entry.logical,
            tag: entry.tag,
        }))
    }

    pub fn options(&self, poll: Duration) -> VirtualChannelOptions {
        VirtualChannelOptions {
            physical_channel: self.physical_channel,
            max_frame_payload: self.max_frame_payload,
            poll,
        }
    }
}

/// A schema document, on disk or embedded in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum SchemaSource {
    Path(PathBuf),
    Inline(Value),
}

impl SchemaSource {
    pub fn load(&self) -> Result<RegisterSchema> {
        let schema = match self {
            Self::Path(path) => RegisterSchema::from_file(path)?,
            Self::Inline(document) => RegisterSchema::from_value(document, RegistryConfig::default())?,
        };
        Ok(schema)
    }

    pub fn load_commands(&self) -> Result<CommandSet> {
        let commands = match self {
            Self::Path(path) => CommandSet::from_file(path)?,
            Self::Inline(document) => CommandSet::from_value(document, RegistryConfig::default())?,
        };
        Ok(commands)
    }
}

/// An ICD document and how its command responses are checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IcdConfig {
    pub document: SchemaSource,
    /// Reject responses whose magic, id or serial words differ from the
    /// declared layout.
    #[serde(default = "default_check_response_header")]
    pub check_response_header: bool,
}

fn default_check_response_header() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Total bytes all buffers together may hold.
    #[serde(default = "default_pool_bytes")]
    pub pool_bytes: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            pool_bytes: DEFAULT_POOL_BYTES,
        }
    }
}

fn default_pool_bytes() -> usize {
    DEFAULT_POOL_BYTES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl StreamingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl KitConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(document: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(document)
            .map_err(|err| KitError::Config(format!("invalid configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path).map_err(|err| {
            KitError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&document)
    }

    /// Check cross-field rules serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(command) = &self.command {
            command.validate("command")?;
        }
        if let Some(stream) = &self.stream {
            stream.validate("stream")?;
        }
        if self.resources.pool_bytes == 0 {
            return Err(KitError::Config("resources.pool_bytes must be positive".into()));
        }
        if self.streaming.poll_interval_ms == 0 {
            return Err(KitError::Config(
                "streaming.poll_interval_ms must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.middleware {
            if !seen.insert(name.as_str()) {
                return Err(KitError::Config(format!("middleware {name:?} listed twice")));
            }
        }
        if self.virtual_channels.enabled {
            if self.virtual_channels.max_frame_payload == 0 {
                return Err(KitError::Config(
                    "virtual_channels.max_frame_payload must be positive".into(),
                ));
            }
            self.virtual_channels.table()?;
        }
        Ok(())
    }

    /// Load the configured schema, or an empty one when none is configured.
    pub fn load_schema(&self) -> Result<Arc<RegisterSchema>> {
        let schema = match &self.schema {
            Some(source) => source.load()?,
            None => RegisterSchema::new(),
        };
        Ok(Arc::new(schema))
    }
}

impl KitConfig {
    /// Load the configured command set, or an empty one.
    pub fn load_commands(&self) -> Result<CommandSet> {
        match &self.icd {
            Some(icd) => icd.document.load_commands(),
            None => Ok(CommandSet::new()),
        }
    }

    pub fn check_response_header(&self) -> bool {
        self.icd.as_ref().map_or(true, |icd| icd.check_response_header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = KitConfig::from_json_str("{}").unwrap();
        assert_eq!(config, KitConfig::default());
        assert_eq!(config.middleware, vec!["schema", "virtual-channel"]);
        assert_eq!(config.resources.pool_bytes, DEFAULT_POOL_BYTES);
        assert_eq!(config.streaming.poll_interval(), Duration::from_millis(50));
        assert!(!config.virtual_channels.enabled);
    }

    #[test]
    fn unknown_options_rejected_at_every_level() {
        for document in [
            r#"{"transprot": "tcp"}"#,
            r#"{"command": {"transport": "sim", "target": "sim://a", "baud": 9600}}"#,
            r#"{"virtual_channels": {"enabled": true, "chanels": []}}"#,
            r#"{"resources": {"pool": 10}}"#,
            r#"{"schema": {"url": "http://x"}}"#,
        ] {
            let err = KitConfig::from_json_str(document).unwrap_err();
            assert_eq!(err.kind(), "config", "{document}");
        }
    }

    #[test]
    fn interface_section_defaults_and_target() {
        let config = KitConfig::from_json_str(
            r#"{"command": {"transport": "tcp", "target": "tcp://192.168.1.152:5001"}}"#,
        )
        .unwrap();
        let command = config.command.unwrap();
        assert_eq!(command.timeout(), Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(
            command.target().unwrap(),
            Target::Tcp {
                host: "192.168.1.152".into(),
                port: 5001
            }
        );
    }

    #[test]
    fn transport_must_match_scheme() {
        let err = KitConfig::from_json_str(
            r#"{"stream": {"transport": "pcie", "target": "tcp://10.0.0.1:6001"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, KitError::Config(msg) if msg.contains("does not match")));

        let err = KitConfig::from_json_str(
            r#"{"stream": {"transport": "tcp", "target": "nowhere"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn virtual_channel_table_checked_when_enabled() {
        let config = KitConfig::from_json_str(
            r#"{"virtual_channels": {"enabled": true,
                "channels": [{"logical": 1, "tag": 1}, {"logical": 2, "tag": 1}]}}"#,
        );
        assert!(config.is_err());

        let config = KitConfig::from_json_str(r#"{"virtual_channels": {"enabled": true}}"#).unwrap();
        let table = config.virtual_channels.table().unwrap();
        assert_eq!(table.routes().len(), MAX_VIRTUAL_CHANNELS);
    }

    #[test]
    fn duplicate_middleware_rejected() {
        let err = KitConfig::from_json_str(r#"{"middleware": ["schema", "schema"]}"#).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn inline_schema_loads() {
        let config = KitConfig::from_json_str(
            r#"{"schema": {"inline": {"registers": [
                {"name": "STATUS", "address": "0x10", "bit_width": 8}
            ]}}}"#,
        )
        .unwrap();
        let schema = config.load_schema().unwrap();
        assert_eq!(schema.lookup("STATUS").unwrap().address, 0x10);
        assert!(KitConfig::default().load_schema().unwrap().is_empty());
    }

    #[test]
    fn icd_section_loads_commands() {
        let config = KitConfig::from_json_str(
            r#"{"icd": {"document": {"inline": {
                "param": {"freq": ["double", 1.0]},
                "command": {"tune": {
                    "send": [["uint32", 1], ["uint32", 2], ["uint32", 3], ["uint32", 0], "freq"],
                    "recv": []
                }}
            }}, "check_response_header": false}}"#,
        )
        .unwrap();
        assert!(!config.check_response_header());
        let commands = config.load_commands().unwrap();
        assert_eq!(commands.command_names().collect::<Vec<_>>(), vec!["tune"]);

        assert!(KitConfig::default().check_response_header());
        assert!(KitConfig::default().load_commands().unwrap().is_empty());
        let err = KitConfig::from_json_str(r#"{"icd": {"document": {"inline": {}}, "strict": true}}"#)
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn missing_schema_file_is_config_error() {
        let config = KitConfig {
            schema: Some(SchemaSource::Path("/nonexistent/regs.json".into())),
            ..KitConfig::default()
        };
        assert_eq!(config.load_schema().unwrap_err().kind(), "config");
    }

    #[test]
    fn for_target_takes_transport_from_scheme() {
        let section = InterfaceConfig::for_target("sim://bench").unwrap();
        assert_eq!(section.transport, "sim");
        assert!(InterfaceConfig::for_target("bench").is_err());
    }
}
