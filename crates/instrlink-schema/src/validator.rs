use jsonschema::Validator;
use serde_json::Value;

use crate::error::{Result, SchemaError};

/// Layout every register schema document must follow.
pub const DOCUMENT_SCHEMA: &str = r##"{
    "$schema": "https://json-schema.org/draft/2020-12/schema",
    "type": "object",
    "required": ["registers"],
    "properties": {
        "device": { "type": "string" },
        "version": { "type": "string" },
        "registers": {
            "type": "array",
            "items": { "$ref": "#/$defs/register" }
        }
    },
    "$defs": {
        "address": {
            "oneOf": [
                { "type": "integer", "minimum": 0, "maximum": 4294967295 },
                { "type": "string", "pattern": "^(0[xX][0-9a-fA-F]{1,8}|[0-9]+)$" }
            ]
        },
        "register": {
            "type": "object",
            "required": ["name", "address"],
            "properties": {
                "name": { "type": "string", "pattern": "^[A-Za-z_][A-Za-z0-9_.]*$" },
                "address": { "$ref": "#/$defs/address" },
                "bit_offset": { "type": "integer", "minimum": 0, "maximum": 31 },
                "bit_width": { "type": "integer", "minimum": 1, "maximum": 32 },
                "format": { "$ref": "#/$defs/format" },
                "default": { "type": ["integer", "number", "string"] },
                "description": { "type": "string" }
            }
        },
        "format": {
            "oneOf": [
                { "enum": ["uint", "int"] },
                {
                    "type": "object",
                    "required": ["fixed"],
                    "properties": {
                        "fixed": {
                            "type": "object",
                            "required": ["frac_bits"],
                            "properties": {
                                "frac_bits": { "type": "integer", "minimum": 0, "maximum": 32 },
                                "signed": { "type": "boolean" }
                            }
                        }
                    }
                },
                {
                    "type": "object",
                    "required": ["enum"],
                    "properties": {
                        "enum": {
                            "type": "object",
                            "minProperties": 1,
                            "additionalProperties": { "type": "integer", "minimum": 0 }
                        }
                    }
                }
            ]
        }
    }
}"##;

/// Layout of a parameter and command (ICD) document.
pub const ICD_DOCUMENT_SCHEMA: &str = r##"{
    "$schema": "https://json-schema.org/draft/2020-12/schema",
    "type": "object",
    "properties": {
        "param": {
            "type": "object",
            "additionalProperties": { "$ref": "#/$defs/literal" }
        },
        "command": {
            "type": "object",
            "additionalProperties": { "$ref": "#/$defs/command" }
        },
        "sequence": { "type": "object" }
    },
    "$defs": {
        "type": {
            "enum": ["uint8", "int8", "uint16", "int16", "uint32", "int32",
                     "float", "double", "file", "file_length"]
        },
        "literal": {
            "type": "array",
            "prefixItems": [
                { "$ref": "#/$defs/type" },
                { "type": ["integer", "number", "string"] }
            ],
            "minItems": 2,
            "maxItems": 2
        },
        "entry": {
            "oneOf": [
                { "type": "string", "minLength": 1 },
                { "$ref": "#/$defs/literal" }
            ]
        },
        "command": {
            "type": "object",
            "required": ["send", "recv"],
            "properties": {
                "send": { "type": "array", "minItems": 1, "items": { "$ref": "#/$defs/entry" } },
                "recv": { "type": "array", "items": { "$ref": "#/$defs/entry" } }
            }
        }
    }
}"##;

/// Compile the register document schema. Strict mode closes every object
/// schema to keys it does not list.
pub(crate) fn document_validator(strict: bool) -> Result<Validator> {
    compile(DOCUMENT_SCHEMA, strict)
}

/// Compile the ICD document schema.
pub(crate) fn icd_validator(strict: bool) -> Result<Validator> {
    compile(ICD_DOCUMENT_SCHEMA, strict)
}

fn compile(text: &str, strict: bool) -> Result<Validator> {
    let mut schema: Value = serde_json::from_str(text)?;
    if strict {
        apply_strict_mode(&mut schema);
    }
    jsonschema::validator_for(&schema).map_err(|err| SchemaError::CompileFailed(err.to_string()))
}

pub(crate) fn validate_document(document: &Value, validator: &Validator) -> Result<()> {
    let mut errors = validator.iter_errors(document);
    if let Some(first) = errors.next() {
        let mut message = first.to_string();
        for err in errors.take(3) {
            message.push_str("; ");
            message.push_str(&err.to_string());
        }
        return Err(SchemaError::DocumentInvalid(message));
    }

    Ok(())
}

fn apply_strict_mode(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let is_object_schema =
                matches!(map.get("type"), Some(Value::String(kind)) if kind == "object");
            if is_object_schema && !map.contains_key("additionalProperties") {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
            }
            for child in map.values_mut() {
                apply_strict_mode(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                apply_strict_mode(item);
            }
        }
        _ => {}
    }
}
