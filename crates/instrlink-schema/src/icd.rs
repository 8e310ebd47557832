//! Parameter tables and command packets.
//!
//! An ICD document declares named, typed parameters and the commands that
//! carry them. A command lists what goes into its request and what comes
//! back in its response. Each list entry is a literal `[type, value]` pair
//! or the name of a parameter; [`PAYLOAD_ENTRY`] and
//! [`PAYLOAD_LENGTH_ENTRY`] stand for bytes the caller supplies at execute
//! time. Values are packed little-endian and bytes 12..16 of every request
//! carry the request's total length.
//!
//! ```json
//! {
//!   "param": { "freq": ["double", 1.0e9] },
//!   "command": {
//!     "tune": {
//!       "send": [["uint32", "0x5F5F5F5F"], ["uint32", 7], ["uint32", 0], ["uint32", 0], "freq"],
//!       "recv": [["uint32", "0xCFCFCFCF"], ["uint32", 7], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::error::{Result, SchemaError};
use crate::registry::read_document;
use crate::validator::{icd_validator, validate_document};

/// Entry standing for the caller's payload bytes.
pub const PAYLOAD_ENTRY: &str = "__file__";

/// Entry standing for the payload length, packed as a `u32`.
pub const PAYLOAD_LENGTH_ENTRY: &str = "__filelength__";

/// Magic, command id, serial and total length words.
pub const MIN_PACKET_LEN: usize = 16;

const LENGTH_OFFSET: usize = 12;

/// Wire type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    /// Contents of the file named by the value.
    File,
    /// Size of the file named by the value, as a `u32`.
    FileLength,
}

impl ParamType {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "uint8" => Self::U8,
            "int8" => Self::I8,
            "uint16" => Self::U16,
            "int16" => Self::I16,
            "uint32" => Self::U32,
            "int32" => Self::I32,
            "float" => Self::F32,
            "double" => Self::F64,
            "file" => Self::File,
            "file_length" => Self::FileLength,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::I8 => "int8",
            Self::U16 => "uint16",
            Self::I16 => "int16",
            Self::U32 => "uint32",
            Self::I32 => "int32",
            Self::F32 => "float",
            Self::F64 => "double",
            Self::File => "file",
            Self::FileLength => "file_length",
        }
    }

    /// Packed width in bytes. File contents have none.
    pub fn size(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 | Self::FileLength => Some(4),
            Self::F64 => Some(8),
            Self::File => None,
        }
    }

    fn int_range(self) -> Option<(i64, i64)> {
        match self {
            Self::U8 => Some((0, u8::MAX.into())),
            Self::I8 => Some((i8::MIN.into(), i8::MAX.into())),
            Self::U16 => Some((0, u16::MAX.into())),
            Self::I16 => Some((i16::MIN.into(), i16::MAX.into())),
            Self::U32 => Some((0, u32::MAX.into())),
            Self::I32 => Some((i32::MIN.into(), i32::MAX.into())),
            _ => None,
        }
    }

    fn is_path(self) -> bool {
        matches!(self, Self::File | Self::FileLength)
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter value. Integers and floats are stored already checked
/// against their type; file types hold a path.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// A typed value: a table parameter or a literal command entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: ParamType,
    pub value: ParamValue,
}

impl Param {
    /// Coerce `value` to `ty`. `name` labels errors.
    ///
    /// Text converts to numbers: `0x` and `0b` prefixes give integers,
    /// anything else parses as decimal.
    pub fn new(name: &str, ty: ParamType, value: ParamValue) -> Result<Self> {
        let value = coerce(name, ty, value)?;
        Ok(Self { ty, value })
    }

    fn pack(&self, name: &str, out: &mut Vec<u8>) -> Result<()> {
        match (self.ty, &self.value) {
            (ParamType::File, ParamValue::Text(path)) => {
                let data = std::fs::read(path)
                    .map_err(|err| SchemaError::LoadFailed(format!("{name}: {path}: {err}")))?;
                out.extend_from_slice(&data);
            }
            (ParamType::FileLength, ParamValue::Text(path)) => {
                let len = std::fs::metadata(path)
                    .map_err(|err| SchemaError::LoadFailed(format!("{name}: {path}: {err}")))?
                    .len();
                let len = u32::try_from(len).map_err(|_| out_of_range(name, len, ParamType::FileLength))?;
                out.extend_from_slice(&len.to_le_bytes());
            }
            (ParamType::F32, ParamValue::Float(v)) => out.extend_from_slice(&(*v as f32).to_le_bytes()),
            (ParamType::F64, ParamValue::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (ty, ParamValue::Int(v)) => {
                let v = *v;
                let range = |_| out_of_range(name, v, ty);
                match ty {
                    ParamType::U8 => out.push(u8::try_from(v).map_err(range)?),
                    ParamType::I8 => out.extend_from_slice(&i8::try_from(v).map_err(range)?.to_le_bytes()),
                    ParamType::U16 => out.extend_from_slice(&u16::try_from(v).map_err(range)?.to_le_bytes()),
                    ParamType::I16 => out.extend_from_slice(&i16::try_from(v).map_err(range)?.to_le_bytes()),
                    ParamType::U32 => out.extend_from_slice(&u32::try_from(v).map_err(range)?.to_le_bytes()),
                    ParamType::I32 => out.extend_from_slice(&i32::try_from(v).map_err(range)?.to_le_bytes()),
                    _ => return Err(mismatch(name, ty, &self.value)),
                }
            }
            (ty, value) => return Err(mismatch(name, ty, value)),
        }
        Ok(())
    }

    fn unpack(ty: ParamType, bytes: &[u8]) -> Option<ParamValue> {
        Some(match ty {
            ParamType::U8 => ParamValue::Int((*bytes.first()?).into()),
            ParamType::I8 => ParamValue::Int(i8::from_le_bytes(bytes.try_into().ok()?).into()),
            ParamType::U16 => ParamValue::Int(u16::from_le_bytes(bytes.try_into().ok()?).into()),
            ParamType::I16 => ParamValue::Int(i16::from_le_bytes(bytes.try_into().ok()?).into()),
            ParamType::U32 => ParamValue::Int(u32::from_le_bytes(bytes.try_into().ok()?).into()),
            ParamType::I32 => ParamValue::Int(i32::from_le_bytes(bytes.try_into().ok()?).into()),
            ParamType::F32 => ParamValue::Float(f32::from_le_bytes(bytes.try_into().ok()?).into()),
            ParamType::F64 => ParamValue::Float(f64::from_le_bytes(bytes.try_into().ok()?)),
            ParamType::File | ParamType::FileLength => return None,
        })
    }
}

fn coerce(name: &str, ty: ParamType, value: ParamValue) -> Result<ParamValue> {
    if ty.is_path() {
        return match value {
            text @ ParamValue::Text(_) => Ok(text),
            other => Err(mismatch(name, ty, &other)),
        };
    }
    let value = match value {
        ParamValue::Text(text) => parse_text(&text).ok_or_else(|| SchemaError::InvalidValue {
            register: name.to_string(),
            detail: format!("{text:?} is not a number"),
        })?,
        number => number,
    };
    match (ty.int_range(), value) {
        (Some((min, max)), ParamValue::Int(v)) => {
            if v < min || v > max {
                return Err(out_of_range(name, v, ty));
            }
            Ok(ParamValue::Int(v))
        }
        (Some(_), ParamValue::Float(v)) if v.is_finite() && v.fract() == 0.0 => {
            coerce(name, ty, ParamValue::Int(v as i64))
        }
        (Some(_), other) => Err(mismatch(name, ty, &other)),
        (None, ParamValue::Int(v)) => coerce(name, ty, ParamValue::Float(v as f64)),
        (None, ParamValue::Float(v)) => {
            if ty == ParamType::F32 && v.is_finite() && v.abs() > f64::from(f32::MAX) {
                return Err(out_of_range(name, v, ty));
            }
            Ok(ParamValue::Float(v))
        }
        (None, other) => Err(mismatch(name, ty, &other)),
    }
}

fn parse_text(text: &str) -> Option<ParamValue> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(ParamValue::Int);
    }
    if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        return i64::from_str_radix(bin, 2).ok().map(ParamValue::Int);
    }
    if let Ok(v) = text.parse::<i64>() {
        return Some(ParamValue::Int(v));
    }
    text.parse::<f64>().ok().map(ParamValue::Float)
}

fn out_of_range(name: &str, value: impl fmt::Display, ty: ParamType) -> SchemaError {
    SchemaError::ValueRange {
        register: name.to_string(),
        detail: format!("{value} does not fit {ty}"),
    }
}

fn mismatch(name: &str, ty: ParamType, value: &ParamValue) -> SchemaError {
    SchemaError::InvalidValue {
        register: name.to_string(),
        detail: format!("{value:?} is not a {ty} value"),
    }
}

/// One element of a command's request or response layout.
#[derive(Debug, Clone, PartialEq)]
pub enum PackEntry {
    Literal(Param),
    /// A parameter from the table, by name.
    Param(String),
    /// The payload passed to execute.
    Payload,
    /// The payload's length, as a `u32`.
    PayloadLength,
}

/// Request and response layouts of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDef {
    pub send: Vec<PackEntry>,
    pub recv: Vec<PackEntry>,
}

impl CommandDef {
    /// Whether the request carries parameter `name`.
    pub fn sends_param(&self, name: &str) -> bool {
        self.send
            .iter()
            .any(|entry| matches!(entry, PackEntry::Param(param) if param == name))
    }
}

#[derive(Deserialize)]
struct IcdDocument {
    #[serde(default)]
    param: BTreeMap<String, (String, Value)>,
    #[serde(default)]
    command: BTreeMap<String, CommandEntry>,
    #[serde(default)]
    sequence: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct CommandEntry {
    send: Vec<EntryLiteral>,
    recv: Vec<EntryLiteral>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EntryLiteral {
    Name(String),
    Value(String, Value),
}

/// Parameter table plus the commands that carry it.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    params: BTreeMap<String, Param>,
    commands: BTreeMap<String, CommandDef>,
    config: RegistryConfig,
}

impl CommandSet {
    /// An empty set with default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an ICD document from a JSON string.
    pub fn from_json_str(document: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(document)?;
        Self::from_value(&value, RegistryConfig::default())
    }

    /// Load an ICD document from a parsed JSON value.
    pub fn from_value(document: &Value, config: RegistryConfig) -> Result<Self> {
        let validator = icd_validator(config.strict_mode)?;
        validate_document(document, &validator)?;

        let parsed: IcdDocument = serde_json::from_value(document.clone())?;
        if parsed.param.len() + parsed.command.len() > config.max_registers {
            return Err(SchemaError::LoadFailed(format!(
                "parameter and command count exceeds configured max ({})",
                config.max_registers
            )));
        }
        if !parsed.sequence.is_empty() {
            warn!(
                sequences = parsed.sequence.len(),
                "command sequences are not supported; ignoring them"
            );
        }

        let mut set = Self {
            config,
            ..Self::default()
        };
        for (name, (ty, value)) in parsed.param {
            let param = literal(&name, &ty, value)?;
            set.params.insert(name, param);
        }
        for (name, entry) in parsed.command {
            let def = CommandDef {
                send: set.resolve_all(&name, entry.send)?,
                recv: set.resolve_all(&name, entry.recv)?,
            };
            set.check_response_layout(&name, &def.recv)?;
            set.commands.insert(name, def);
        }
        debug!(
            params = set.params.len(),
            commands = set.commands.len(),
            "loaded command set"
        );
        Ok(set)
    }

    /// Load an ICD document from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with_config(path, RegistryConfig::default())
    }

    pub fn from_file_with_config(path: &Path, config: RegistryConfig) -> Result<Self> {
        let content = read_document(path, &config)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_value(&value, config)
    }

    fn resolve_all(&self, command: &str, entries: Vec<EntryLiteral>) -> Result<Vec<PackEntry>> {
        entries
            .into_iter()
            .map(|entry| self.resolve(command, entry))
            .collect()
    }

    fn resolve(&self, command: &str, entry: EntryLiteral) -> Result<PackEntry> {
        match entry {
            EntryLiteral::Name(name) if name == PAYLOAD_ENTRY => Ok(PackEntry::Payload),
            EntryLiteral::Name(name) if name == PAYLOAD_LENGTH_ENTRY => Ok(PackEntry::PayloadLength),
            EntryLiteral::Name(name) if self.params.contains_key(&name) => Ok(PackEntry::Param(name)),
            EntryLiteral::Name(name) => Err(SchemaError::InvalidCommand {
                command: command.to_string(),
                reason: format!("{name:?} is not a declared parameter"),
            }),
            EntryLiteral::Value(ty, value) => Ok(PackEntry::Literal(literal(command, &ty, value)?)),
        }
    }

    // Responses are fixed-size: no payload and no file contents.
    fn check_response_layout(&self, command: &str, recv: &[PackEntry]) -> Result<()> {
        for entry in recv {
            let ty = match entry {
                PackEntry::Literal(param) => Some(param.ty),
                PackEntry::Param(name) => self.params.get(name).map(|param| param.ty),
                PackEntry::Payload | PackEntry::PayloadLength => None,
            };
            if !matches!(ty, Some(ty) if !ty.is_path()) {
                return Err(SchemaError::InvalidCommand {
                    command: command.to_string(),
                    reason: "response entries must be fixed-size values".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Set a parameter, converting `value` to its declared type. Names not
    /// in the table are added as `uint32`.
    pub fn set_param(&mut self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        let ty = self
            .params
            .get(name)
            .map_or(ParamType::U32, |param| param.ty);
        let param = Param::new(name, ty, value.into())?;
        debug!(param = name, value = %param.value, "parameter set");
        self.params.insert(name.to_string(), param);
        Ok(())
    }

    pub fn get_param(&self, name: &str) -> Result<ParamValue> {
        self.param(name).map(|param| param.value.clone())
    }

    pub fn param(&self, name: &str) -> Result<&Param> {
        self.params
            .get(name)
            .ok_or_else(|| SchemaError::UnknownParam(name.to_string()))
    }

    /// Parameters in name order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.params.iter().map(|(name, param)| (name.as_str(), param))
    }

    pub fn command(&self, name: &str) -> Result<&CommandDef> {
        self.commands
            .get(name)
            .ok_or_else(|| SchemaError::UnknownCommand(name.to_string()))
    }

    /// Command names in name order.
    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Commands to run for `name`: the command itself when one has that
    /// name, otherwise every command whose request carries parameter
    /// `name`.
    pub fn commands_for(&self, name: &str) -> Vec<&str> {
        if let Some((command, _)) = self.commands.get_key_value(name) {
            return vec![command.as_str()];
        }
        self.commands
            .iter()
            .filter(|(_, def)| def.sends_param(name))
            .map(|(command, _)| command.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.params.is_empty()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn pack(&self, command: &str, entries: &[PackEntry], payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for entry in entries {
            match entry {
                PackEntry::Literal(param) => param.pack(command, &mut out)?,
                PackEntry::Param(name) => self.param(name)?.pack(name, &mut out)?,
                PackEntry::Payload => out.extend_from_slice(payload),
                PackEntry::PayloadLength => {
                    let len = u32::try_from(payload.len())
                        .map_err(|_| out_of_range(PAYLOAD_LENGTH_ENTRY, payload.len(), ParamType::U32))?;
                    out.extend_from_slice(&len.to_le_bytes());
                }
            }
        }
        Ok(out)
    }

    fn patch_length(command: &str, packet: &mut [u8]) -> Result<()> {
        if packet.len() < MIN_PACKET_LEN {
            return Err(SchemaError::InvalidCommand {
                command: command.to_string(),
                reason: format!(
                    "packet is {} bytes; at least {MIN_PACKET_LEN} are needed",
                    packet.len()
                ),
            });
        }
        let total = u32::try_from(packet.len())
            .map_err(|_| out_of_range(command, packet.len(), ParamType::U32))?;
        packet[LENGTH_OFFSET..MIN_PACKET_LEN].copy_from_slice(&total.to_le_bytes());
        Ok(())
    }

    /// Build the request packet for `command`.
    pub fn format_request(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let def = self.command(command)?;
        let mut packet = self.pack(command, &def.send, payload)?;
        Self::patch_length(command, &mut packet)?;
        Ok(packet)
    }

    /// Bytes the device answers `command` with.
    pub fn response_len(&self, command: &str) -> Result<usize> {
        let def = self.command(command)?;
        def.recv.iter().try_fold(0usize, |total, entry| {
            let ty = match entry {
                PackEntry::Literal(param) => param.ty,
                PackEntry::Param(name) => self.param(name)?.ty,
                PackEntry::Payload | PackEntry::PayloadLength => ParamType::File,
            };
            let size = ty.size().ok_or_else(|| SchemaError::InvalidCommand {
                command: command.to_string(),
                reason: "response entries must be fixed-size values".to_string(),
            })?;
            Ok(total + size)
        })
    }

    /// The response `command` should produce, with its length word filled
    /// in. Used to check the header of a real response.
    pub fn response_template(&self, command: &str) -> Result<Vec<u8>> {
        let def = self.command(command)?;
        let mut packet = self.pack(command, &def.recv, &[])?;
        Self::patch_length(command, &mut packet)?;
        Ok(packet)
    }

    /// Compare the magic, id and serial words of `response` with the
    /// command's response layout.
    pub fn check_response(&self, command: &str, response: &[u8]) -> Result<()> {
        let template = self.response_template(command)?;
        for (label, offset) in [("head", 0), ("id", 4), ("serial", 8)] {
            let expected = word_at(&template, offset);
            let found = word_at(response, offset);
            if found != expected {
                return Err(SchemaError::ResponseMismatch {
                    command: command.to_string(),
                    detail: format!(
                        "{label} should be {}, got {}",
                        show_word(expected),
                        show_word(found)
                    ),
                });
            }
        }
        Ok(())
    }

    /// Store every parameter the response layout names from `response`.
    /// Returns the names updated, in layout order.
    pub fn apply_response(&mut self, command: &str, response: &[u8]) -> Result<Vec<String>> {
        let recv = self.command(command)?.recv.clone();
        let needed = self.response_len(command)?;
        if response.len() < needed {
            return Err(SchemaError::ResponseMismatch {
                command: command.to_string(),
                detail: format!("{} bytes received, layout needs {needed}", response.len()),
            });
        }

        let mut offset = 0;
        let mut updated = Vec::new();
        for entry in &recv {
            match entry {
                PackEntry::Literal(param) => offset += param.ty.size().unwrap_or(0),
                PackEntry::Param(name) => {
                    let ty = self.param(name)?.ty;
                    let size = ty.size().unwrap_or(0);
                    let value = Param::unpack(ty, &response[offset..offset + size]).ok_or_else(|| {
                        SchemaError::ResponseMismatch {
                            command: command.to_string(),
                            detail: format!("cannot decode {name} as {ty}"),
                        }
                    })?;
                    self.params.insert(name.clone(), Param { ty, value });
                    updated.push(name.clone());
                    offset += size;
                }
                PackEntry::Payload | PackEntry::PayloadLength => {}
            }
        }
        Ok(updated)
    }
}

fn literal(name: &str, ty: &str, value: Value) -> Result<Param> {
    let ty = ParamType::parse(ty).ok_or_else(|| SchemaError::InvalidValue {
        register: name.to_string(),
        detail: format!("unknown type {ty:?}"),
    })?;
    let value = match value {
        Value::String(text) => ParamValue::Text(text),
        Value::Number(n) => match n.as_i64() {
            Some(v) => ParamValue::Int(v),
            None => ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        other => {
            return Err(SchemaError::InvalidValue {
                register: name.to_string(),
                detail: format!("unsupported value {other}"),
            })
        }
    };
    Param::new(name, ty, value)
}

fn word_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let word = bytes.get(offset..offset + 4)?;
    word.try_into().ok().map(u32::from_le_bytes)
}

fn show_word(word: Option<u32>) -> String {
    match word {
        Some(word) => format!("{word:#010x}"),
        None => "nothing".to_string(),
    }
}
