use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::RegistryConfig;
use crate::error::{Result, SchemaError};
use crate::field::{FieldFormat, FieldValue, RegisterDef, REGISTER_BITS};
use crate::validator::{document_validator, validate_document};

/// Name-keyed table of register field definitions.
#[derive(Debug, Clone)]
pub struct RegisterSchema {
    defs: Vec<RegisterDef>,
    index: HashMap<String, usize>,
    device: Option<String>,
    config: RegistryConfig,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    device: Option<String>,
    registers: Vec<RegisterEntry>,
}

#[derive(Deserialize)]
struct RegisterEntry {
    name: String,
    address: AddressLiteral,
    #[serde(default)]
    bit_offset: u8,
    #[serde(default = "full_width")]
    bit_width: u8,
    #[serde(default)]
    format: FormatEntry,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressLiteral {
    Number(u32),
    Text(String),
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum FormatEntry {
    #[default]
    Uint,
    Int,
    Fixed {
        frac_bits: u8,
        #[serde(default)]
        signed: bool,
    },
    Enum(BTreeMap<String, u64>),
}

fn full_width() -> u8 {
    REGISTER_BITS
}

impl RegisterSchema {
    /// Create an empty schema with default config.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create an empty schema with explicit config.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            defs: Vec::new(),
            index: HashMap::new(),
            device: None,
            config,
        }
    }

    /// Build a schema from definitions made in code.
    pub fn from_definitions(defs: impl IntoIterator<Item = RegisterDef>) -> Result<Self> {
        let mut schema = Self::new();
        for def in defs {
            schema.insert(def)?;
        }
        Ok(schema)
    }

    /// Add one definition. Names must be unique.
    pub fn insert(&mut self, def: RegisterDef) -> Result<()> {
        def.validate()?;
        if self.index.contains_key(&def.name) {
            return Err(SchemaError::InvalidDefinition {
                register: def.name,
                reason: "defined more than once".to_string(),
            });
        }
        if self.defs.len() >= self.config.max_registers {
            return Err(SchemaError::LoadFailed(format!(
                "register count exceeds configured max ({})",
                self.config.max_registers
            )));
        }
        self.index.insert(def.name.clone(), self.defs.len());
        self.defs.push(def);
        Ok(())
    }

    /// Load a schema document from a JSON string.
    pub fn from_json_str(document: &str) -> Result<Self> {
        Self::from_json_str_with_config(document, RegistryConfig::default())
    }

    /// Load a schema document from a JSON string with explicit config.
    pub fn from_json_str_with_config(document: &str, config: RegistryConfig) -> Result<Self> {
        let value: Value = serde_json::from_str(document)?;
        Self::from_value(&value, config)
    }

    /// Load a schema document from a parsed JSON value.
    pub fn from_value(document: &Value, config: RegistryConfig) -> Result<Self> {
        let validator = document_validator(config.strict_mode)?;
        validate_document(document, &validator)?;

        let parsed: Document = serde_json::from_value(document.clone())?;
        let mut schema = Self::with_config(config);
        schema.device = parsed.device;
        for entry in parsed.registers {
            schema.insert(entry.into_def()?)?;
        }
        debug!(
            registers = schema.len(),
            device = schema.device.as_deref().unwrap_or("-"),
            "loaded register schema"
        );
        Ok(schema)
    }

    /// Load a schema document from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with_config(path, RegistryConfig::default())
    }

    /// Load a schema document from a file with explicit config.
    pub fn from_file_with_config(path: &Path, config: RegistryConfig) -> Result<Self> {
        let content = read_document(path, &config)?;
        Self::from_json_str_with_config(&content, config)
    }

    /// Resolve a register name.
    pub fn lookup(&self, name: &str) -> Result<&RegisterDef> {
        self.get(name)
            .ok_or_else(|| SchemaError::UnknownRegister(name.to_string()))
    }

    /// Resolve a register name, if present.
    pub fn get(&self, name: &str) -> Option<&RegisterDef> {
        self.index.get(name).map(|&i| &self.defs[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Definitions in load order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDef> {
        self.defs.iter()
    }

    /// All fields that live in the register word at `address`.
    pub fn fields_at(&self, address: u32) -> impl Iterator<Item = &RegisterDef> {
        self.defs.iter().filter(move |def| def.address == address)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Device name declared by the document, if any.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Get schema configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

impl Default for RegisterSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterEntry {
    fn into_def(self) -> Result<RegisterDef> {
        let address = match &self.address {
            AddressLiteral::Number(n) => *n,
            AddressLiteral::Text(text) => parse_address(text).ok_or_else(|| {
                SchemaError::InvalidDefinition {
                    register: self.name.clone(),
                    reason: format!("bad address {text:?}"),
                }
            })?,
        };
        let format = match self.format {
            FormatEntry::Uint => FieldFormat::Unsigned,
            FormatEntry::Int => FieldFormat::Signed,
            FormatEntry::Fixed { frac_bits, signed } => FieldFormat::Fixed { frac_bits, signed },
            FormatEntry::Enum(labels) => FieldFormat::Enumerated(labels),
        };
        let default = match self.default {
            None => None,
            Some(Value::String(label)) => Some(FieldValue::Label(label)),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(v) => Some(FieldValue::Int(v)),
                None => n.as_f64().map(FieldValue::Float),
            },
            Some(other) => {
                return Err(SchemaError::InvalidDefinition {
                    register: self.name,
                    reason: format!("unsupported default {other}"),
                })
            }
        };
        Ok(RegisterDef {
            name: self.name,
            address,
            bit_offset: self.bit_offset,
            bit_width: self.bit_width,
            format,
            default,
            description: self.description,
        })
    }
}

/// Read a document file, refusing symlinks and anything over the
/// configured size.
pub(crate) fn read_document(path: &Path, config: &RegistryConfig) -> Result<String> {
    let metadata = std::fs::symlink_metadata(path)
        .map_err(|err| SchemaError::LoadFailed(format!("{}: {err}", path.display())))?;
    if metadata.file_type().is_symlink() {
        return Err(SchemaError::LoadFailed(format!(
            "refusing to load schema symlink: {}",
            path.display()
        )));
    }
    if !metadata.is_file() {
        return Err(SchemaError::LoadFailed(format!(
            "not a regular file: {}",
            path.display()
        )));
    }
    if metadata.len() > config.max_document_size as u64 {
        return Err(SchemaError::LoadFailed(format!(
            "schema document too large ({} bytes): {}",
            metadata.len(),
            path.display()
        )));
    }

    let file = std::fs::File::open(path).map_err(|err| {
        SchemaError::LoadFailed(format!("failed opening schema {}: {err}", path.display()))
    })?;
    let max_bytes = config.max_document_size;
    let read_limit = u64::try_from(max_bytes.saturating_add(1)).unwrap_or(u64::MAX);
    let mut content = String::new();
    file.take(read_limit)
        .read_to_string(&mut content)
        .map_err(|err| {
            SchemaError::LoadFailed(format!("failed reading schema {}: {err}", path.display()))
        })?;
    if content.len() > max_bytes {
        return Err(SchemaError::LoadFailed(format!(
            "schema document too large while reading: {}",
            path.display()
        )));
    }
    Ok(content)
}

fn parse_address(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const DOCUMENT: &str = r#"{
        "device": "adc-board",
        "registers": [
            { "name": "STATUS", "address": "0x10", "bit_width": 8, "default": 0 },
            { "name": "MODE", "address": "0x10", "bit_offset": 8, "bit_width": 2,
              "format": { "enum": { "IDLE": 0, "RUN": 1 } }, "default": "IDLE" },
            { "name": "GAIN", "address": 20, "bit_width": 16,
              "format": { "fixed": { "frac_bits": 8, "signed": true } } }
        ]
    }"#;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("instrlink-schema-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_and_lookup() {
        let schema = RegisterSchema::from_json_str(DOCUMENT).unwrap();
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.device(), Some("adc-board"));

        let status = schema.lookup("STATUS").unwrap();
        assert_eq!(status.address, 0x10);
        assert_eq!(status.bit_width, 8);

        let mode = schema.lookup("MODE").unwrap();
        assert_eq!(mode.default, Some(FieldValue::Label("IDLE".into())));
        assert_eq!(schema.fields_at(0x10).count(), 2);

        let gain = schema.lookup("GAIN").unwrap();
        assert_eq!(gain.address, 20);
        assert!(matches!(gain.format, FieldFormat::Fixed { frac_bits: 8, signed: true }));
    }

    #[test]
    fn unknown_name_is_lookup_error() {
        let schema = RegisterSchema::from_json_str(DOCUMENT).unwrap();
        assert!(matches!(
            schema.lookup("NOPE"),
            Err(SchemaError::UnknownRegister(name)) if name == "NOPE"
        ));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = RegisterSchema::from_definitions([
            RegisterDef::new("A", 0),
            RegisterDef::new("A", 4),
        ])
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefinition { .. }));
    }

    #[test]
    fn default_outside_field_rejected() {
        let doc = r#"{ "registers": [ { "name": "S", "address": 0, "bit_width": 2, "default": 9 } ] }"#;
        assert!(matches!(
            RegisterSchema::from_json_str(doc),
            Err(SchemaError::ValueRange { .. })
        ));
    }

    #[test]
    fn register_limit_enforced() {
        let config = RegistryConfig {
            max_registers: 1,
            ..RegistryConfig::default()
        };
        let doc = r#"{ "registers": [ { "name": "A", "address": 0 }, { "name": "B", "address": 4 } ] }"#;
        assert!(matches!(
            RegisterSchema::from_json_str_with_config(doc, config),
            Err(SchemaError::LoadFailed(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = temp_dir("file");
        let path = dir.join("device.json");
        std::fs::write(&path, DOCUMENT).unwrap();

        let schema = RegisterSchema::from_file(&path).unwrap();
        assert!(schema.contains("GAIN"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn oversized_file_rejected() {
        let dir = temp_dir("big");
        let path = dir.join("device.json");
        std::fs::write(&path, DOCUMENT).unwrap();

        let config = RegistryConfig {
            max_document_size: 16,
            ..RegistryConfig::default()
        };
        assert!(matches!(
            RegisterSchema::from_file_with_config(&path, config),
            Err(SchemaError::LoadFailed(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_document_rejected() {
        let dir = temp_dir("link");
        let real = dir.join("real.json");
        let link = dir.join("link.json");
        std::fs::write(&real, DOCUMENT).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert!(matches!(
            RegisterSchema::from_file(&link),
            Err(SchemaError::LoadFailed(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn address_literals() {
        assert_eq!(parse_address("0x1F"), Some(0x1F));
        assert_eq!(parse_address("64"), Some(64));
        assert_eq!(parse_address("0xZZ"), None);
    }
}
