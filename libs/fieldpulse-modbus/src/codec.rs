//! Register codec
//!
//! Pure conversions from raw 16-bit register words into typed engineering
//! values: byte-order permutation handling, multi-word assembly, bit
//! extraction and scale/offset/rounding. Decode failures are reported as
//! `None`, never as panics, so a malformed payload costs one value and
//! nothing else.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Byte/word ordering for multi-register values.
///
/// Vendors disagree on how the bytes of a 32/64-bit value are laid out
/// across consecutive registers. The four permutations here cover the
/// combinations seen in the field:
///
/// - `Abcd`: natural word order, big-endian bytes (the Modbus default)
/// - `Cdab`: natural word order, bytes swapped within each word
/// - `Badc`: reversed word order, big-endian bytes within each word
/// - `Dcba`: fully reversed; realizes as word-order reversal because the
///   in-word byte swap cancels against the whole-buffer reversal, so it is
///   numerically identical to `Badc`
///
/// Legacy labels `BE`/`LE` map to `Abcd`/`Dcba`; anything unrecognized
/// falls back to `Abcd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Abcd,
    Cdab,
    Badc,
    Dcba,
}

impl ByteOrder {
    /// Parse a configuration label, tolerating legacy spellings.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_uppercase().as_str() {
            "ABCD" | "BE" | "BIG_ENDIAN" => ByteOrder::Abcd,
            "CDAB" => ByteOrder::Cdab,
            "BADC" => ByteOrder::Badc,
            "DCBA" | "LE" | "LITTLE_ENDIAN" => ByteOrder::Dcba,
            _ => ByteOrder::Abcd,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            ByteOrder::Abcd => "ABCD",
            ByteOrder::Cdab => "CDAB",
            ByteOrder::Badc => "BADC",
            ByteOrder::Dcba => "DCBA",
        }
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

impl Serialize for ByteOrder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_label())
    }
}

impl<'de> Deserialize<'de> for ByteOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(ByteOrder::from_label(&label))
    }
}

/// Register data types understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Double,
    String,
    Bits,
    Int32Float32,
}

impl DataType {
    /// Default number of registers a read of this type occupies.
    ///
    /// `String` has no default: its length is part of the register
    /// definition and must be supplied explicitly.
    pub fn register_count(&self) -> Option<u16> {
        match self {
            DataType::Bool | DataType::Int16 | DataType::Uint16 | DataType::Bits => Some(1),
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => Some(2),
            DataType::Double | DataType::Int32Float32 => Some(4),
            DataType::String => None,
        }
    }
}

/// Display-mode selector for the composite `int32_float32` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    Int32,
    Float32,
    #[default]
    Both,
}

/// A decoded register value.
///
/// `Composite` carries both views of the `int32_float32` type; the display
/// mode decides which of them is surfaced (or both). Sub-values are held as
/// `f64` so scaling applies uniformly (`i32` and `f32` both widen
/// losslessly).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Composite {
        #[serde(rename = "int32Value")]
        int32: f64,
        #[serde(rename = "float32Value")]
        float32: f64,
    },
}

impl Value {
    /// Collapse an `f64` to `Integer` when it carries no fractional part.
    ///
    /// Keeps round numbers serializing as `26` rather than `26.0`, matching
    /// what downstream consumers of the records expect.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
            Value::Integer(value as i64)
        } else {
            Value::Float(value)
        }
    }

    /// Numeric view of this value, when one exists.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Assemble raw register words into a byte buffer honoring the permutation.
pub fn assemble_bytes(words: &[u16], order: ByteOrder) -> Vec<u8> {
    let mut buf = Vec::with_capacity(words.len() * 2);
    match order {
        ByteOrder::Abcd => {
            for w in words {
                buf.extend_from_slice(&w.to_be_bytes());
            }
        },
        ByteOrder::Cdab => {
            for w in words {
                buf.extend_from_slice(&w.to_le_bytes());
            }
        },
        // Word-order reversal, natural bytes within each word. DCBA's
        // nominal double reversal cancels at the byte level and lands on
        // the same layout as BADC.
        ByteOrder::Badc | ByteOrder::Dcba => {
            for w in words.iter().rev() {
                buf.extend_from_slice(&w.to_be_bytes());
            }
        },
    }
    buf
}

/// Decode raw register words into a typed value.
///
/// Returns `None` when the payload is too short or otherwise malformed for
/// the requested type; the caller logs and moves on.
pub fn decode(words: &[u16], data_type: DataType, order: ByteOrder) -> Option<Value> {
    match data_type {
        DataType::Bool => words.first().map(|w| Value::Bool(*w != 0)),
        DataType::Int16 => words.first().map(|w| Value::Integer(*w as i16 as i64)),
        DataType::Uint16 | DataType::Bits => words.first().map(|w| Value::Integer(*w as i64)),
        DataType::Int32 => {
            let bytes = take_bytes::<4>(words, order)?;
            Some(Value::Integer(i32::from_be_bytes(bytes) as i64))
        },
        DataType::Uint32 => {
            let bytes = take_bytes::<4>(words, order)?;
            Some(Value::Integer(u32::from_be_bytes(bytes) as i64))
        },
        DataType::Float32 => {
            let bytes = take_bytes::<4>(words, order)?;
            Some(Value::Float(f32::from_be_bytes(bytes) as f64))
        },
        DataType::Double => {
            let bytes = take_bytes::<8>(words, order)?;
            Some(Value::Float(f64::from_be_bytes(bytes)))
        },
        DataType::Int32Float32 => {
            let bytes = take_bytes::<8>(words, order)?;
            let int_bytes: [u8; 4] = bytes[0..4].try_into().ok()?;
            let float_bytes: [u8; 4] = bytes[4..8].try_into().ok()?;
            Some(Value::Composite {
                int32: i32::from_be_bytes(int_bytes) as f64,
                float32: f32::from_be_bytes(float_bytes) as f64,
            })
        },
        DataType::String => {
            if words.is_empty() {
                return None;
            }
            let bytes = assemble_bytes(words, order);
            let text = String::from_utf8_lossy(&bytes)
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string();
            Some(Value::Text(text))
        },
    }
}

/// Assemble and take exactly `N` bytes, or `None` if the raw data is short.
fn take_bytes<const N: usize>(words: &[u16], order: ByteOrder) -> Option<[u8; N]> {
    let needed = N / 2;
    if words.len() < needed {
        return None;
    }
    let buf = assemble_bytes(&words[..needed], order);
    buf[..N].try_into().ok()
}

/// Extract a single bit from a register word.
///
/// Returns `None` when the bit index lies outside 0..=15.
pub fn extract_bit(value: u16, bit_index: u8) -> Option<bool> {
    if bit_index > 15 {
        return None;
    }
    Some((value >> bit_index) & 1 == 1)
}

/// Apply the linear transform and round to the configured precision.
///
/// `processed = raw * scale + offset`, rounded to `decimals` places.
pub fn apply_scaling(value: f64, scale: f64, offset: f64, decimals: u32) -> f64 {
    let scaled = value * scale + offset;
    let factor = 10f64.powi(decimals as i32);
    (scaled * factor).round() / factor
}

// ============================================================================
// Tests
// ============================================================================
