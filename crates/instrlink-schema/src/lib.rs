//! Register schemas.
//!
//! A schema names every device register field: which word it lives in,
//! which bits it occupies, and how those bits turn into a value (plain
//! integer, fixed-point, or an enumeration of labels). Schemas are built in
//! code or loaded from a JSON document that is checked against an embedded
//! JSON Schema before use.
//!
//! [`icd`] covers the other half of a device's control surface: named
//! parameters packed into command packets.

pub mod config;
pub mod error;
pub mod field;
pub mod icd;
pub mod registry;
pub mod validator;

pub use config::RegistryConfig;
pub use error::{Result, SchemaError};
pub use field::{FieldFormat, FieldValue, RegisterDef, REGISTER_BITS};
pub use icd::{CommandDef, CommandSet, PackEntry, Param, ParamType, ParamValue};
pub use registry::RegisterSchema;
