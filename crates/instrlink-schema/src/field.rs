use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SchemaError};

/// Width of a device register word in bits.
pub const REGISTER_BITS: u8 = 32;

/// How the bits of a field map to a value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFormat {
    /// Unsigned integer.
    Unsigned,
    /// Two's-complement integer.
    Signed,
    /// Fixed-point number with `frac_bits` fractional bits.
    Fixed { frac_bits: u8, signed: bool },
    /// Named values: label to raw field bits.
    Enumerated(BTreeMap<String, u64>),
}

impl FieldFormat {
    /// Short name used in diagnostics and tables.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unsigned => "uint",
            Self::Signed => "int",
            Self::Fixed { .. } => "fixed",
            Self::Enumerated(_) => "enum",
        }
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Label(String),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Label(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Label(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Label(v) => f.write_str(v),
        }
    }
}

/// One named register field.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDef {
    /// Symbolic name used by callers.
    pub name: String,
    /// Byte address of the register word holding the field.
    pub address: u32,
    /// Position of the field's least significant bit in the word.
    pub bit_offset: u8,
    /// Number of bits in the field.
    pub bit_width: u8,
    /// Value encoding.
    pub format: FieldFormat,
    /// Value the field holds after reset, if documented.
    pub default: Option<FieldValue>,
    /// Free-form description.
    pub description: Option<String>,
}

impl RegisterDef {
    /// A full-word unsigned register.
    pub fn new(name: impl Into<String>, address: u32) -> Self {
        Self {
            name: name.into(),
            address,
            bit_offset: 0,
            bit_width: REGISTER_BITS,
            format: FieldFormat::Unsigned,
            default: None,
            description: None,
        }
    }

    /// Restrict to a bit field inside the word.
    pub fn bits(mut self, bit_offset: u8, bit_width: u8) -> Self {
        self.bit_offset = bit_offset;
        self.bit_width = bit_width;
        self
    }

    pub fn format(mut self, format: FieldFormat) -> Self {
        self.format = format;
        self
    }

    pub fn default_value(mut self, value: impl Into<FieldValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Check the layout is consistent.
    pub fn validate(&self) -> Result<()> {
        let end = self.bit_offset as u16 + self.bit_width as u16;
        if self.bit_width == 0 || end > REGISTER_BITS as u16 {
            return Err(self.invalid(format!(
                "bits {}..{} do not fit a {REGISTER_BITS}-bit register",
                self.bit_offset, end
            )));
        }
        match &self.format {
            FieldFormat::Fixed { frac_bits, .. } if *frac_bits > self.bit_width => {
                return Err(self.invalid(format!(
                    "{frac_bits} fractional bits exceed field width {}",
                    self.bit_width
                )));
            }
            FieldFormat::Enumerated(labels) => {
                if labels.is_empty() {
                    return Err(self.invalid("enumeration has no labels"));
                }
                let max = self.raw_max();
                if let Some((label, raw)) = labels.iter().find(|(_, raw)| **raw > max) {
                    return Err(self.invalid(format!(
                        "label {label:?} value {raw} exceeds field width {}",
                        self.bit_width
                    )));
                }
            }
            _ => {}
        }
        if let Some(default) = &self.default {
            self.encode(default)?;
        }
        Ok(())
    }

    /// Mask of the field bits in register position.
    pub fn mask(&self) -> u32 {
        (self.raw_max() as u32) << self.bit_offset
    }

    /// Whether the field covers the whole register word.
    pub fn is_full_word(&self) -> bool {
        self.bit_offset == 0 && self.bit_width == REGISTER_BITS
    }

    /// Place field bits into `word`, leaving the other bits as they were.
    pub fn insert(&self, word: u32, raw: u32) -> u32 {
        (word & !self.mask()) | ((raw << self.bit_offset) & self.mask())
    }

    /// Pull the field bits out of `word`.
    pub fn extract(&self, word: u32) -> u32 {
        (word & self.mask()) >> self.bit_offset
    }

    /// Encode a value to raw field bits (not yet shifted into position).
    pub fn encode(&self, value: &FieldValue) -> Result<u32> {
        let raw = match (&self.format, value) {
            (FieldFormat::Unsigned, _) => {
                let v = self.integral(value)?;
                self.check_range(v, 0, self.raw_max() as i64)?;
                v as u64
            }
            (FieldFormat::Signed, _) => {
                let v = self.integral(value)?;
                let (min, max) = self.signed_bounds();
                self.check_range(v, min, max)?;
                v as u64
            }
            (FieldFormat::Fixed { frac_bits, signed }, FieldValue::Int(v)) => {
                self.fixed_raw(*v as f64, *frac_bits, *signed)?
            }
            (FieldFormat::Fixed { frac_bits, signed }, FieldValue::Float(v)) => {
                self.fixed_raw(*v, *frac_bits, *signed)?
            }
            (FieldFormat::Fixed { .. }, FieldValue::Label(label)) => {
                return Err(self.bad_value(format!("expected a number, got label {label:?}")));
            }
            (FieldFormat::Enumerated(labels), FieldValue::Label(label)) => {
                *labels.get(label).ok_or_else(|| {
                    let known: Vec<&str> = labels.keys().map(String::as_str).collect();
                    self.bad_value(format!("unknown label {label:?} (expected one of {known:?})"))
                })?
            }
            (FieldFormat::Enumerated(_), _) => {
                let v = self.integral(value)?;
                self.check_range(v, 0, self.raw_max() as i64)?;
                v as u64
            }
        };
        Ok((raw & self.raw_max()) as u32)
    }

    /// Decode raw field bits (already extracted) to a value.
    ///
    /// Enumerations fall back to the raw integer when the device reports a
    /// value with no label.
    pub fn decode(&self, raw: u32) -> FieldValue {
        let raw = raw as u64 & self.raw_max();
        match &self.format {
            FieldFormat::Unsigned => FieldValue::Int(raw as i64),
            FieldFormat::Signed => FieldValue::Int(self.sign_extend(raw)),
            FieldFormat::Fixed { frac_bits, signed } => {
                let v = if *signed {
                    self.sign_extend(raw)
                } else {
                    raw as i64
                };
                FieldValue::Float(v as f64 / (1u64 << frac_bits) as f64)
            }
            FieldFormat::Enumerated(labels) => labels
                .iter()
                .find(|(_, value)| **value == raw)
                .map(|(label, _)| FieldValue::Label(label.clone()))
                .unwrap_or(FieldValue::Int(raw as i64)),
        }
    }

    fn fixed_raw(&self, number: f64, frac_bits: u8, signed: bool) -> Result<u64> {
        if !number.is_finite() {
            return Err(self.bad_value(format!("{number} is not a finite number")));
        }
        let one = (1u64 << frac_bits) as f64;
        let scaled = (number * one).round();
        let (min, max) = if signed {
            self.signed_bounds()
        } else {
            (0, self.raw_max() as i64)
        };
        if scaled < min as f64 || scaled > max as f64 {
            return Err(self.out_of_range(format!(
                "{number} outside {}..={}",
                min as f64 / one,
                max as f64 / one
            )));
        }
        Ok(scaled as i64 as u64)
    }

    fn raw_max(&self) -> u64 {
        (1u64 << self.bit_width) - 1
    }

    fn signed_bounds(&self) -> (i64, i64) {
        let half = 1i64 << (self.bit_width - 1);
        (-half, half - 1)
    }

    fn sign_extend(&self, raw: u64) -> i64 {
        let shift = 64 - self.bit_width as u32;
        ((raw << shift) as i64) >> shift
    }

    fn integral(&self, value: &FieldValue) -> Result<i64> {
        match value {
            FieldValue::Int(v) => Ok(*v),
            FieldValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Ok(*v as i64),
            FieldValue::Float(v) => Err(self.bad_value(format!("{v} is not an integer"))),
            FieldValue::Label(label) => {
                Err(self.bad_value(format!("expected a number, got label {label:?}")))
            }
        }
    }

    fn check_range(&self, v: i64, min: i64, max: i64) -> Result<()> {
        if v < min || v > max {
            return Err(self.out_of_range(format!("{v} outside {min}..={max}")));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> SchemaError {
        SchemaError::InvalidDefinition {
            register: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn out_of_range(&self, detail: String) -> SchemaError {
        SchemaError::ValueRange {
            register: self.name.clone(),
            detail,
        }
    }

    fn bad_value(&self, detail: String) -> SchemaError {
        SchemaError::InvalidValue {
            register: self.name.clone(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes() -> FieldFormat {
        FieldFormat::Enumerated(BTreeMap::from([
            ("IDLE".to_string(), 0),
            ("RUN".to_string(), 1),
            ("CAL".to_string(), 2),
        ]))
    }

    #[test]
    fn test_insert_preserves_neighbours() {
        let def = RegisterDef::new("MODE", 0x18).bits(4, 2);
        assert_eq!(def.mask(), 0b11_0000);
        let word = def.insert(0xFFFF_FF0F, 0b10);
        assert_eq!(word, 0xFFFF_FF2F);
        assert_eq!(def.extract(word), 0b10);
    }

    #[test]
    fn test_unsigned_range() {
        let def = RegisterDef::new("STATUS", 0x10).bits(0, 8);
        assert_eq!(def.encode(&FieldValue::Int(255)).unwrap(), 255);
        assert!(matches!(
            def.encode(&FieldValue::Int(256)),
            Err(SchemaError::ValueRange { .. })
        ));
        assert!(matches!(
            def.encode(&FieldValue::Int(-1)),
            Err(SchemaError::ValueRange { .. })
        ));
    }

    #[test]
    fn test_signed_encode_decode() {
        let def = RegisterDef::new("OFFSET", 0x20)
            .bits(8, 12)
            .format(FieldFormat::Signed);
        let raw = def.encode(&FieldValue::Int(-5)).unwrap();
        assert_eq!(raw, 0xFFB);
        assert_eq!(def.decode(raw), FieldValue::Int(-5));
        assert!(def.encode(&FieldValue::Int(2048)).is_err());
        assert!(def.encode(&FieldValue::Int(-2048)).is_ok());
    }

    #[test]
    fn test_fixed_point() {
        let def = RegisterDef::new("GAIN", 0x24)
            .bits(0, 16)
            .format(FieldFormat::Fixed {
                frac_bits: 8,
                signed: true,
            });
        let raw = def.encode(&FieldValue::Float(-1.5)).unwrap();
        assert_eq!(raw, 0xFE80);
        assert_eq!(def.decode(raw), FieldValue::Float(-1.5));
        assert!(matches!(
            def.encode(&FieldValue::Float(128.0)),
            Err(SchemaError::ValueRange { .. })
        ));
        assert!(matches!(
            def.encode(&FieldValue::Label("x".into())),
            Err(SchemaError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_enumerated() {
        let def = RegisterDef::new("MODE", 0x18).bits(4, 2).format(modes());
        assert_eq!(def.encode(&"CAL".into()).unwrap(), 2);
        assert_eq!(def.decode(1), FieldValue::Label("RUN".into()));
        assert_eq!(def.decode(3), FieldValue::Int(3));
        assert!(matches!(
            def.encode(&"SLEEP".into()),
            Err(SchemaError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_integral_float_accepted() {
        let def = RegisterDef::new("COUNT", 0x0);
        assert_eq!(def.encode(&FieldValue::Float(7.0)).unwrap(), 7);
        assert!(def.encode(&FieldValue::Float(7.5)).is_err());
    }

    #[test]
    fn test_full_word() {
        let def = RegisterDef::new("DATA", 0x0);
        assert!(def.is_full_word());
        assert_eq!(def.mask(), u32::MAX);
        assert_eq!(def.encode(&FieldValue::Int(u32::MAX as i64)).unwrap(), u32::MAX);
    }

    #[test]
    fn test_validate_layout() {
        assert!(RegisterDef::new("A", 0).bits(30, 4).validate().is_err());
        assert!(RegisterDef::new("B", 0).bits(0, 0).validate().is_err());
        assert!(RegisterDef::new("C", 0)
            .bits(0, 4)
            .default_value(99)
            .validate()
            .is_err());
        let bad_enum = RegisterDef::new("D", 0).bits(0, 1).format(modes());
        assert!(bad_enum.validate().is_err());
    }
}
