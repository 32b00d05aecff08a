//! FieldPulse Modbus Library
//!
//! Modbus master implementation for the FieldPulse acquisition service.
//! Covers the read-only function codes (coils, discrete inputs, holding and
//! input registers) over Modbus TCP, RTU over TCP and serial RTU, plus the
//! value pipeline that turns raw register words into typed point values.
//!
//! # Architecture
//!
//! - **Framing**: PDU builders, MBAP and RTU codecs (`frame`)
//! - **Links**: TCP/serial connection handling (`link`)
//! - **Transport**: the `Transport` trait and its socket-backed
//!   implementation with per-exchange locking (`transport`)
//! - **Decoding**: byte-order permutations, typed decode, scaling (`codec`)
//! - **Registers**: point definitions as they appear in device profiles
//!   (`register`)
//! - **Reading**: the `RegisterSource` trait tying transport and decoding
//!   together (`reader`)
//!
//! # Features
//!
//! - `rtu` - serial RTU links via tokio-serial (default)
//! - `synthetic` - in-process substitutes generating plausible values
//!   without a physical bus (default)

pub mod codec;
pub mod error;
pub mod frame;
pub mod link;
pub mod reader;
pub mod register;
#[cfg(feature = "synthetic")]
pub mod synthetic;
pub mod transport;

// Re-export core types
pub use codec::{ByteOrder, DataType, DisplayMode, Value};
pub use error::{ModbusError, Result};
pub use link::LinkSettings;
pub use reader::{process_raw_words, ModbusReader, RegisterSource};
pub use register::{RegisterDefinition, RegisterFunction};
pub use transport::{ModbusTransport, Transport};

#[cfg(feature = "synthetic")]
pub use synthetic::{SyntheticReader, SyntheticTransport};
