//! Register reading
//!
//! One register definition in, one typed value out. The reader issues a
//! single transport request, bounds it with a grace period on top of the
//! configured timeout, then runs the raw words through the codec and the
//! definition's post-processing. Failures are returned, never thrown past
//! this boundary, and each failure triggers a best-effort flush so a stale
//! response cannot poison the next exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::codec::{self, DataType, DisplayMode, Value};
use crate::error::{ModbusError, Result};
use crate::register::RegisterDefinition;
use crate::transport::Transport;

/// Slack added on top of the per-device timeout when racing a read, so the
/// transport's own timeout normally fires first.
const READ_GRACE: Duration = Duration::from_millis(100);

/// Source of decoded register values.
///
/// Implemented by the Modbus reader and by the synthetic generator, so the
/// polling layer never knows which one is active.
#[async_trait]
pub trait RegisterSource: Send + Sync {
    /// Read one register of one device.
    async fn read(
        &self,
        slave_id: u8,
        timeout: Duration,
        register: &RegisterDefinition,
    ) -> Result<Value>;
}

/// Turn raw transport words into the register's final value.
///
/// Bits are extracted and never scaled; booleans and strings pass through;
/// every other numeric value gets the linear transform and rounding. The
/// composite type resolves its display mode here.
pub fn process_raw_words(words: &[u16], register: &RegisterDefinition) -> Result<Value> {
    let decoded = codec::decode(words, register.data_type, register.byte_order).ok_or_else(|| {
        ModbusError::decode(format!(
            "register '{}': cannot decode {} raw words as {:?}",
            register.name,
            words.len(),
            register.data_type
        ))
    })?;

    let value = match decoded {
        Value::Bool(_) | Value::Text(_) => decoded,
        Value::Integer(raw) if register.data_type == DataType::Bits => {
            let index = register.bit_index.unwrap_or(0);
            let bit = codec::extract_bit(raw as u16, index).ok_or_else(|| {
                ModbusError::decode(format!(
                    "register '{}': bit index {index} outside 0-15",
                    register.name
                ))
            })?;
            Value::Bool(bit)
        },
        Value::Integer(raw) => Value::from_f64(codec::apply_scaling(
            raw as f64,
            register.scale,
            register.offset,
            register.decimals,
        )),
        Value::Float(raw) => Value::from_f64(codec::apply_scaling(
            raw,
            register.scale,
            register.offset,
            register.decimals,
        )),
        Value::Composite { int32, float32 } => {
            let int32 = codec::apply_scaling(int32, register.scale, register.offset, register.decimals);
            let float32 =
                codec::apply_scaling(float32, register.scale, register.offset, register.decimals);
            match register.display_mode {
                DisplayMode::Int32 => Value::from_f64(int32),
                DisplayMode::Float32 => Value::from_f64(float32),
                DisplayMode::Both => Value::Composite { int32, float32 },
            }
        },
    };
    Ok(value)
}

/// Reads registers through a live transport.
pub struct ModbusReader {
    transport: Arc<dyn Transport>,
}

impl ModbusReader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn flush_after_failure(&self) {
        if let Err(e) = self.transport.flush().await {
            debug!("flush after failed read: {}", e);
        }
    }
}

#[async_trait]
impl RegisterSource for ModbusReader {
    async fn read(
        &self,
        slave_id: u8,
        timeout: Duration,
        register: &RegisterDefinition,
    ) -> Result<Value> {
        let count = register.word_count().ok_or_else(|| {
            ModbusError::invalid_request(format!(
                "register '{}': string type requires an explicit length",
                register.name
            ))
        })?;
        let function_code = register.function.function_code();

        let outcome = tokio::time::timeout(
            timeout + READ_GRACE,
            self.transport
                .request(slave_id, function_code, register.address, count, timeout),
        )
        .await;

        let words = match outcome {
            Ok(Ok(words)) => words,
            Ok(Err(e)) => {
                self.flush_after_failure().await;
                return Err(e);
            },
            Err(_) => {
                self.flush_after_failure().await;
                return Err(ModbusError::timeout(format!(
                    "register '{}' read overran its {}ms budget",
                    register.name,
                    (timeout + READ_GRACE).as_millis()
                )));
            },
        };

        match process_raw_words(&words, register) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.flush_after_failure().await;
                Err(e)
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
