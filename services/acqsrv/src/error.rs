//! Error handling for the acquisition service
//!
//! Wraps the protocol library error and adds the service-level failure
//! classes (configuration, validation, persistence).

use thiserror::Error;

use fieldpulse_modbus::ModbusError;

/// Acquisition service error type
#[derive(Error, Debug)]
pub enum AcqError {
    /// Protocol or link errors surfaced by the Modbus library
    #[error(transparent)]
    Modbus(#[from] ModbusError),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Synchronous validation failures (bad slave id, malformed register)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Persistence sink errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the acquisition service
pub type Result<T> = std::result::Result<T, AcqError>;

impl From<std::io::Error> for AcqError {
    fn from(err: std::io::Error) -> Self {
        AcqError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AcqError {
    fn from(err: serde_json::Error) -> Self {
        AcqError::Storage(format!("JSON error: {err}"))
    }
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl AcqError {
    pub fn config(msg: impl Into<String>) -> Self {
        AcqError::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AcqError::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        AcqError::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AcqError::Internal(msg.into())
    }

    /// Whether the underlying failure is a link-level fault (connection
    /// refused, link closed, not connected) rather than a device-level one.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, AcqError::Modbus(e) if e.is_link_fault())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_modbus_error_passes_through() {
        let err: AcqError = ModbusError::NotConnected.into();
        assert_eq!(err.to_string(), "Not connected");
        assert!(err.is_link_fault());
    }

    #[test]
    fn test_device_level_error_is_not_link_fault() {
        let err: AcqError = ModbusError::timeout("no response within 500ms").into();
        assert!(!err.is_link_fault());

        let err = AcqError::validation("slave id 0 out of range");
        assert!(!err.is_link_fault());
    }

    #[test]
    fn test_helper_constructors() {
        assert_eq!(
            AcqError::config("missing ports").to_string(),
            "Configuration error: missing ports"
        );
        assert_eq!(
            AcqError::storage("disk full").to_string(),
            "Storage error: disk full"
        );
    }
}
