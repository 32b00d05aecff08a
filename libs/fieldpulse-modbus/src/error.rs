//! Modbus Layer Error Types
//!
//! Core error types for the acquisition protocol layer.

use thiserror::Error;

/// Result type for fieldpulse-modbus operations
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Modbus layer errors
#[derive(Debug, Error, Clone)]
pub enum ModbusError {
    /// Connection establishment or link errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Request or response timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol-level errors (framing, CRC, unexpected responses)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Modbus exception response from the slave
    #[error("Modbus exception 0x{code:02X}: {description}")]
    Exception { code: u8, description: String },

    /// Raw payload could not be decoded into a typed value
    #[error("Decode error: {0}")]
    Decode(String),

    /// Unsupported function code or register family
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    /// Invalid register definition or request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Io(err.to_string())
    }
}

// Helper methods for creating errors
impl ModbusError {
    pub fn connection(msg: impl Into<String>) -> Self {
        ModbusError::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ModbusError::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        ModbusError::Decode(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        ModbusError::InvalidRequest(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config(msg.into())
    }

    /// Check if this error indicates the link itself is broken
    ///
    /// Link-level faults are handled differently from per-register failures:
    /// the caller should treat the connection as lost rather than counting an
    /// ordinary read failure.
    pub fn is_link_fault(&self) -> bool {
        match self {
            ModbusError::Connection(_) | ModbusError::NotConnected => true,
            ModbusError::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
                    || msg.contains("Network is unreachable")
                    || msg.contains("unexpected end of file")
            },
            _ => false,
        }
    }
}
