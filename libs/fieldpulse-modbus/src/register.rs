//! Register definitions
//!
//! Configuration-supplied description of a single acquisition point: where
//! it lives on the bus, how to decode it and how to post-process the value.

use serde::{Deserialize, Serialize};

use crate::codec::{ByteOrder, DataType, DisplayMode};
use crate::error::{ModbusError, Result};

/// Modbus read function family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterFunction {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl RegisterFunction {
    /// Wire function code for a read of this family.
    pub fn function_code(&self) -> u8 {
        match self {
            RegisterFunction::Coil => 0x01,
            RegisterFunction::Discrete => 0x02,
            RegisterFunction::Holding => 0x03,
            RegisterFunction::Input => 0x04,
        }
    }

    /// Coils and discrete inputs carry one bit per address.
    pub fn is_bit_level(&self) -> bool {
        matches!(self, RegisterFunction::Coil | RegisterFunction::Discrete)
    }
}

impl std::fmt::Display for RegisterFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RegisterFunction::Coil => "coil",
            RegisterFunction::Discrete => "discrete",
            RegisterFunction::Holding => "holding",
            RegisterFunction::Input => "input",
        };
        write!(f, "{label}")
    }
}

/// One configured register: addressing, decoding and post-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDefinition {
    /// Display name, unique within the device
    pub name: String,
    /// Free-form grouping key for the device snapshot
    pub category: String,
    /// Register address (0-65535)
    pub address: u16,
    /// Modbus read function family
    pub function: RegisterFunction,
    /// Value encoding
    pub data_type: DataType,
    /// Number of registers to read; mandatory for strings, otherwise
    /// derived from the data type
    pub length: Option<u16>,
    /// Bit position within the register word (0-15), `bits` type only
    pub bit_index: Option<u8>,
    /// Word/byte layout for multi-register values
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Scale factor for the linear transform (processed = raw * scale + offset)
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Offset for the linear transform
    #[serde(default)]
    pub offset: f64,
    /// Decimal places the processed value is rounded to
    #[serde(default)]
    pub decimals: u32,
    /// Engineering unit attached to the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Lower alarm bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    /// Upper alarm bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    /// Which view of the composite `int32_float32` type is surfaced
    #[serde(default)]
    pub display_mode: DisplayMode,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterDefinition {
    /// Number of registers a read of this definition occupies.
    ///
    /// `None` only for a string without an explicit length, which
    /// `validate` rejects before a definition reaches the reader.
    pub fn word_count(&self) -> Option<u16> {
        self.length.or_else(|| self.data_type.register_count())
    }

    /// Check consistency of the definition.
    pub fn validate(&self) -> Result<()> {
        if let Some(length) = self.length {
            if !(1..=125).contains(&length) {
                return Err(ModbusError::config(format!(
                    "register '{}': length {} outside 1-125",
                    self.name, length
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err(ModbusError::config(format!(
                    "register '{}': min_value {} above max_value {}",
                    self.name, min, max
                )));
            }
        }
        match self.data_type {
            DataType::String => {
                if self.length.is_none() {
                    return Err(ModbusError::config(format!(
                        "register '{}': string type requires an explicit length",
                        self.name
                    )));
                }
            },
            DataType::Bits => {
                match self.bit_index {
                    None => {
                        return Err(ModbusError::config(format!(
                            "register '{}': bits type requires bit_index",
                            self.name
                        )));
                    },
                    Some(index) if index > 15 => {
                        return Err(ModbusError::config(format!(
                            "register '{}': bit_index {} outside 0-15",
                            self.name, index
                        )));
                    },
                    Some(_) => {},
                }
            },
            _ => {
                if self.bit_index.is_some() {
                    return Err(ModbusError::config(format!(
                        "register '{}': bit_index is only valid for the bits type",
                        self.name
                    )));
                }
            },
        }
        Ok(())
    }

    /// Whether either alarm bound is configured.
    pub fn has_alarm_bounds(&self) -> bool {
        self.min_value.is_some() || self.max_value.is_some()
    }

    /// True when a processed value lies outside the configured bounds.
    ///
    /// Always false when no bound is configured.
    pub fn exceeds_bounds(&self, value: f64) -> bool {
        if let Some(min) = self.min_value {
            if value < min {
                return true;
            }
        }
        if let Some(max) = self.max_value {
            if value > max {
                return true;
            }
        }
        false
    }
}

// ============================================================================
// Tests
// ============================================================================
