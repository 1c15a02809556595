//! Typed decoding and encoding of holding-register words.
//!
//! Decoding reads the words a [`RegisterDescriptor`] needs from a
//! [`ValueSnapshot`] and returns `None` when any of them is unknown.
//! Encoding turns a [`TypedValue`] back into the single raw word written
//! with Modbus function 0x06.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::ValueSnapshot;

/// Address of the device-wide flag whose bit 0 inverts boolean bits.
pub const DEFAULT_INVERSION_FLAG_ADDRESS: u16 = 0x0104;

/// Errors produced while encoding a value for a register write.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("Value {value} is out of range for register '{name}'")]
    OutOfRange { name: String, value: f64 },
    #[error("Unknown option '{label}' for register '{name}'")]
    UnknownOption { name: String, label: String },
    #[error("Cannot encode {value} as {data_type} for register '{name}'")]
    Unsupported {
        name: String,
        data_type: DataType,
        value: &'static str,
    },
}

/// Data type interpretation for holding registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit integer (default)
    #[default]
    #[serde(alias = "u16")]
    Uint16,
    /// Signed 16-bit integer (two's complement)
    #[serde(alias = "i16")]
    Int16,
    /// Unsigned 32-bit integer (2 registers, high word first)
    #[serde(alias = "u32")]
    Uint32,
    /// 32-bit IEEE-754 float (2 registers, high word first)
    #[serde(alias = "f32")]
    Float32,
    /// Packed ASCII, two characters per register, high byte first
    Ascii,
    /// Individual flag bits
    Bitfield,
}

impl DataType {
    /// Return the string name for this data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Uint32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Ascii => "ascii",
            DataType::Bitfield => "bitfield",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label for one bit of a bitfield register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitLabel {
    /// Bit index (0 = least significant)
    pub bit: u8,
    /// Human-readable label
    pub label: String,
}

/// Label for one raw value of an enumerated register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionLabel {
    /// Raw register value
    pub value: u16,
    /// Human-readable label
    pub label: String,
}

/// Describes how to interpret one register (or group of adjacent registers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Register name (used in logs and for CLI writes)
    pub name: String,

    /// Starting address (0-based)
    pub address: u16,

    /// Data type interpretation
    #[serde(default)]
    pub data_type: DataType,

    /// Scaling factor (value * scale)
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Decimal places kept after scaling
    #[serde(default)]
    pub precision: u8,

    /// Number of registers for ASCII values
    #[serde(default = "default_word_count")]
    pub word_count: u16,

    /// Declared bits for bitfield registers
    #[serde(default)]
    pub bits: Vec<BitLabel>,

    /// Whether the device-wide inversion flag applies to these bits
    #[serde(default)]
    pub invertible: bool,

    /// Raw value labels for enumerated registers
    #[serde(default)]
    pub options: Vec<OptionLabel>,

    /// Unit of measurement (for metadata)
    #[serde(default)]
    pub unit: Option<String>,

    /// Lowest accepted value for writes, in scaled units
    #[serde(default)]
    pub min: Option<f64>,

    /// Highest accepted value for writes, in scaled units
    #[serde(default)]
    pub max: Option<f64>,

    /// Whether writes are allowed
    #[serde(default)]
    pub writable: bool,
}

fn default_scale() -> f64 {
    1.0
}

fn default_word_count() -> u16 {
    1
}

impl RegisterDescriptor {
    /// Create a descriptor with default scale, precision and no labels.
    pub fn new(name: impl Into<String>, address: u16, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            address,
            data_type,
            scale: default_scale(),
            precision: 0,
            word_count: default_word_count(),
            bits: Vec::new(),
            invertible: false,
            options: Vec::new(),
            unit: None,
            min: None,
            max: None,
            writable: false,
        }
    }

    pub fn with_scale(mut self, scale: f64, precision: u8) -> Self {
        self.scale = scale;
        self.precision = precision;
        self
    }

    pub fn with_word_count(mut self, word_count: u16) -> Self {
        self.word_count = word_count;
        self
    }

    pub fn with_bit(mut self, bit: u8, label: impl Into<String>) -> Self {
        self.bits.push(BitLabel {
            bit,
            label: label.into(),
        });
        self
    }

    pub fn with_option(mut self, value: u16, label: impl Into<String>) -> Self {
        self.options.push(OptionLabel {
            value,
            label: label.into(),
        });
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn invertible(mut self) -> Self {
        self.invertible = true;
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Number of consecutive registers this descriptor spans.
    pub fn words(&self) -> u16 {
        match self.data_type {
            DataType::Uint32 | DataType::Float32 => 2,
            DataType::Ascii => self.word_count.max(1),
            DataType::Uint16 | DataType::Int16 | DataType::Bitfield => 1,
        }
    }

    /// Every register address this descriptor reads from.
    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.words()).filter_map(|offset| self.address.checked_add(offset))
    }

    fn option_label(&self, raw: u16) -> Option<&str> {
        self.options
            .iter()
            .find(|option| option.value == raw)
            .map(|option| option.label.as_str())
    }

    fn scaled(&self, raw: f64) -> f64 {
        round_to(raw * self.scale, self.precision)
    }
}

/// One decoded flag bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flag {
    pub bit: u8,
    pub label: String,
    pub on: bool,
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TypedValue {
    /// Scaled numeric value.
    Number(f64),
    /// ASCII text.
    Text(String),
    /// Boolean state (switch-like registers).
    Bool(bool),
    /// Label of an enumerated value.
    Choice(String),
    /// Decoded flag bits.
    Flags(Vec<Flag>),
}

impl TypedValue {
    fn kind(&self) -> &'static str {
        match self {
            TypedValue::Number(_) => "number",
            TypedValue::Text(_) => "text",
            TypedValue::Bool(_) => "bool",
            TypedValue::Choice(_) => "choice",
            TypedValue::Flags(_) => "flags",
        }
    }
}

/// Round `value` to `precision` decimal places, halves away from zero.
pub fn round_to(value: f64, precision: u8) -> f64 {
    let factor = 10f64.powi(i32::from(precision));
    (value * factor).round() / factor
}

/// Interpret a raw word as a two's-complement signed value.
pub fn to_signed(raw: u16) -> i32 {
    if raw > 0x7FFF {
        i32::from(raw) - 0x10000
    } else {
        i32::from(raw)
    }
}

/// Decode the value described by `descriptor` from `snapshot`.
///
/// Returns `None` when any required word is missing or unknown.
pub fn decode(
    snapshot: &ValueSnapshot,
    descriptor: &RegisterDescriptor,
    inversion_address: u16,
) -> Option<TypedValue> {
    let address = descriptor.address;

    match descriptor.data_type {
        DataType::Uint16 => {
            let raw = snapshot.word(address)?;
            if descriptor.options.is_empty() {
                Some(TypedValue::Number(descriptor.scaled(f64::from(raw))))
            } else {
                descriptor
                    .option_label(raw)
                    .map(|label| TypedValue::Choice(label.to_string()))
            }
        }
        DataType::Int16 => {
            let raw = snapshot.word(address)?;
            Some(TypedValue::Number(
                descriptor.scaled(f64::from(to_signed(raw))),
            ))
        }
        DataType::Uint32 => {
            let (high, low) = word_pair(snapshot, address)?;
            let value = (u32::from(high) << 16) | u32::from(low);
            Some(TypedValue::Number(descriptor.scaled(f64::from(value))))
        }
        DataType::Float32 => {
            let (high, low) = word_pair(snapshot, address)?;
            let value = words_to_f32(high, low);
            Some(TypedValue::Number(descriptor.scaled(f64::from(value))))
        }
        DataType::Ascii => {
            let words = descriptor
                .addresses()
                .map(|addr| snapshot.word(addr))
                .collect::<Option<Vec<u16>>>()?;
            if words.len() != usize::from(descriptor.words()) {
                return None;
            }
            Some(TypedValue::Text(words_to_ascii(&words)))
        }
        DataType::Bitfield => {
            let raw = snapshot.word(address)?;
            let inverted = descriptor.invertible && inversion_active(snapshot, inversion_address);

            let flags = if descriptor.bits.is_empty() {
                (0..16u8)
                    .map(|bit| Flag {
                        bit,
                        label: bit.to_string(),
                        on: bit_state(raw, address, bit, inverted, inversion_address),
                    })
                    .collect()
            } else {
                descriptor
                    .bits
                    .iter()
                    .map(|def| Flag {
                        bit: def.bit,
                        label: def.label.clone(),
                        on: bit_state(raw, address, def.bit, inverted, inversion_address),
                    })
                    .collect()
            };

            Some(TypedValue::Flags(flags))
        }
    }
}

/// Decode a single bit of the register at `address`.
///
/// When `invertible` is set and the inversion flag is active, the bit is
/// flipped unless it is bit 0 of the inversion flag register itself.
pub fn decode_bit(
    snapshot: &ValueSnapshot,
    address: u16,
    bit: u8,
    invertible: bool,
    inversion_address: u16,
) -> Option<bool> {
    let raw = snapshot.word(address)?;
    let inverted = invertible && inversion_active(snapshot, inversion_address);
    Some(bit_state(raw, address, bit, inverted, inversion_address))
}

/// Encode `value` into the raw word written to `descriptor`'s register.
pub fn encode(value: &TypedValue, descriptor: &RegisterDescriptor) -> Result<u16, EncodeError> {
    match (descriptor.data_type, value) {
        (DataType::Uint16, TypedValue::Choice(label)) if !descriptor.options.is_empty() => {
            descriptor
                .options
                .iter()
                .find(|option| option.label == *label)
                .map(|option| option.value)
                .ok_or_else(|| EncodeError::UnknownOption {
                    name: descriptor.name.clone(),
                    label: label.clone(),
                })
        }
        (DataType::Uint16 | DataType::Int16, TypedValue::Number(value)) => {
            encode_number(*value, descriptor)
        }
        (DataType::Uint16 | DataType::Bitfield, TypedValue::Bool(on)) => Ok(u16::from(*on)),
        (DataType::Bitfield, TypedValue::Flags(flags)) => Ok(flags
            .iter()
            .filter(|flag| flag.on && flag.bit < 16)
            .fold(0u16, |raw, flag| raw | (1 << flag.bit))),
        (data_type, value) => Err(EncodeError::Unsupported {
            name: descriptor.name.clone(),
            data_type,
            value: value.kind(),
        }),
    }
}

/// Encode `value` as [`encode`] does, then flip the bits the inversion
/// flag would flip on decode so the written value reads back unchanged.
///
/// Only invertible bitfields are affected. Bit 0 of the inversion flag
/// register is always written literally.
pub fn encode_inverted(
    snapshot: &ValueSnapshot,
    value: &TypedValue,
    descriptor: &RegisterDescriptor,
    inversion_address: u16,
) -> Result<u16, EncodeError> {
    let raw = encode(value, descriptor)?;
    if descriptor.data_type != DataType::Bitfield
        || !descriptor.invertible
        || !inversion_active(snapshot, inversion_address)
    {
        return Ok(raw);
    }

    let mut mask = match value {
        TypedValue::Flags(flags) => flags
            .iter()
            .filter(|flag| flag.bit < 16)
            .fold(0u16, |mask, flag| mask | (1 << flag.bit)),
        _ => 0x0001,
    };
    if descriptor.address == inversion_address {
        mask &= !0x0001;
    }
    Ok(raw ^ mask)
}

fn encode_number(value: f64, descriptor: &RegisterDescriptor) -> Result<u16, EncodeError> {
    let out_of_range = || EncodeError::OutOfRange {
        name: descriptor.name.clone(),
        value,
    };

    if descriptor.min.is_some_and(|min| value < min)
        || descriptor.max.is_some_and(|max| value > max)
    {
        return Err(out_of_range());
    }

    let raw = (value / descriptor.scale).round();
    if !raw.is_finite() {
        return Err(out_of_range());
    }

    match descriptor.data_type {
        DataType::Int16 => {
            if !(-32768.0..=32767.0).contains(&raw) {
                return Err(out_of_range());
            }
            // Negative values fold back into the unsigned 16-bit range.
            Ok(raw as i16 as u16)
        }
        _ => {
            if !(0.0..=65535.0).contains(&raw) {
                return Err(out_of_range());
            }
            Ok(raw as u16)
        }
    }
}

fn word_pair(snapshot: &ValueSnapshot, address: u16) -> Option<(u16, u16)> {
    let high = snapshot.word(address)?;
    let low = snapshot.word(address.checked_add(1)?)?;
    Some((high, low))
}

fn words_to_f32(high: u16, low: u16) -> f32 {
    let [a, b] = high.to_be_bytes();
    let [c, d] = low.to_be_bytes();
    f32::from_be_bytes([a, b, c, d])
}

fn words_to_ascii(words: &[u16]) -> String {
    let text: String = words
        .iter()
        .flat_map(|word| word.to_be_bytes())
        .map(char::from)
        .collect();
    text.trim_end_matches('\0').to_string()
}

fn inversion_active(snapshot: &ValueSnapshot, inversion_address: u16) -> bool {
    snapshot
        .word(inversion_address)
        .is_some_and(|raw| raw & 0x01 != 0)
}

fn bit_state(raw: u16, address: u16, bit: u8, inverted: bool, inversion_address: u16) -> bool {
    let on = bit < 16 && (raw >> bit) & 1 == 1;
    if inverted && !(address == inversion_address && bit == 0) {
        !on
    } else {
        on
    }
}
