//! Synthetic transport and reader
//!
//! Complete substitutes for the production transport/reader pair, used when
//! acquisition must run without a physical bus. Values drift slowly instead
//! of jumping randomly, so dashboards fed from a bench deployment look like
//! a live site: most ticks nudge the previous value by a bounded delta and
//! the occasional fresh draw can wander past the alarm bounds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};

use crate::codec::{apply_scaling, DataType, DisplayMode, Value};
use crate::error::{ModbusError, Result};
use crate::reader::RegisterSource;
use crate::register::RegisterDefinition;
use crate::transport::Transport;

/// Fraction of ticks that perturb the previous value instead of redrawing.
const SMOOTH_PROBABILITY: f64 = 0.85;

/// Maximum per-tick drift, as a fraction of the working range.
const DRIFT_FRACTION: f64 = 0.05;

/// Per-tick probability that a boolean/bit point flips.
const FLIP_PROBABILITY: f64 = 0.1;

/// Per-tick probability that a string point advances to the next label.
const LABEL_ADVANCE_PROBABILITY: f64 = 0.05;

const STATUS_LABELS: [&str; 4] = ["OK", "RUN", "IDLE", "STANDBY"];

/// Simulated bus latency bounds in milliseconds.
const LATENCY_MS: std::ops::RangeInclusive<u64> = 10..=60;

fn simulated_latency() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(LATENCY_MS))
}

/// Transport stand-in: no I/O, connect/disconnect just flip a flag.
#[derive(Debug, Default)]
pub struct SyntheticTransport {
    connected: AtomicBool,
}

impl SyntheticTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for SyntheticTransport {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!("synthetic transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("synthetic transport disconnected");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        _slave_id: u8,
        _function_code: u8,
        _address: u16,
        count: u16,
        _timeout: Duration,
    ) -> Result<Vec<u16>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ModbusError::NotConnected);
        }
        let latency = simulated_latency();
        tokio::time::sleep(latency).await;
        let mut rng = rand::thread_rng();
        Ok((0..count).map(|_| rng.gen_range(0..=1000u16)).collect())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Identifies one generated point across ticks.
type PointKey = (u8, u16, u8);

/// Register source generating plausible values with temporal smoothing.
#[derive(Debug, Default)]
pub struct SyntheticReader {
    memory: Mutex<HashMap<PointKey, f64>>,
}

impl SyntheticReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate(&self, slave_id: u8, register: &RegisterDefinition) -> Value {
        let key = (slave_id, register.address, register.bit_index.unwrap_or(0));
        match register.data_type {
            DataType::Bool | DataType::Bits => {
                let mut memory = self.memory.lock();
                let state = memory
                    .entry(key)
                    .or_insert_with(|| if rand::thread_rng().gen_bool(0.5) { 1.0 } else { 0.0 });
                if rand::thread_rng().gen_bool(FLIP_PROBABILITY) {
                    *state = 1.0 - *state;
                }
                Value::Bool(*state >= 0.5)
            },
            DataType::String => {
                let mut memory = self.memory.lock();
                let index = memory.entry(key).or_insert(0.0);
                if rand::thread_rng().gen_bool(LABEL_ADVANCE_PROBABILITY) {
                    *index = (*index + 1.0) % STATUS_LABELS.len() as f64;
                }
                Value::Text(STATUS_LABELS[*index as usize].to_string())
            },
            _ => self.generate_numeric(key, register),
        }
    }

    fn generate_numeric(&self, key: PointKey, register: &RegisterDefinition) -> Value {
        let (low, high) = working_range(register);
        let span = high - low;

        let mut memory = self.memory.lock();
        let next = match memory.get(&key) {
            Some(&previous) if rand::thread_rng().gen_bool(SMOOTH_PROBABILITY) => {
                let drift = span * rand::thread_rng().gen_range(-DRIFT_FRACTION..=DRIFT_FRACTION);
                (previous + drift).clamp(low, high)
            },
            _ => rand::thread_rng().gen_range(low..=high),
        };
        memory.insert(key, next);
        drop(memory);

        let rounded = apply_scaling(next, 1.0, 0.0, register.decimals);
        if register.data_type == DataType::Int32Float32 {
            let int32 = apply_scaling(next, 1.0, 0.0, 0);
            match register.display_mode {
                DisplayMode::Int32 => Value::from_f64(int32),
                DisplayMode::Float32 => Value::from_f64(rounded),
                DisplayMode::Both => Value::Composite { int32, float32: rounded },
            }
        } else {
            Value::from_f64(rounded)
        }
    }
}

/// Range generated values live in.
///
/// Alarm bounds, when configured, are widened by roughly 10% so out-of-range
/// excursions occur now and then. Without bounds, a per-type default keeps
/// the numbers plausible.
fn working_range(register: &RegisterDefinition) -> (f64, f64) {
    let (default_low, default_high) = default_range(register.data_type);
    if register.has_alarm_bounds() {
        let min = register.min_value.unwrap_or(default_low);
        let max = register.max_value.unwrap_or(default_high);
        let margin = ((max - min).abs() * 0.1).max(1.0);
        (min - margin, max + margin)
    } else {
        (default_low, default_high)
    }
}

fn default_range(data_type: DataType) -> (f64, f64) {
    match data_type {
        DataType::Int16 => (-100.0, 100.0),
        DataType::Uint16 => (0.0, 100.0),
        DataType::Int32 => (-10_000.0, 10_000.0),
        DataType::Uint32 => (0.0, 10_000.0),
        DataType::Float32 | DataType::Double | DataType::Int32Float32 => (0.0, 100.0),
        // Handled before numeric generation is reached
        DataType::Bool | DataType::Bits | DataType::String => (0.0, 1.0),
    }
}

#[async_trait]
impl RegisterSource for SyntheticReader {
    async fn read(
        &self,
        slave_id: u8,
        _timeout: Duration,
        register: &RegisterDefinition,
    ) -> Result<Value> {
        let latency = simulated_latency();
        tokio::time::sleep(latency).await;
        Ok(self.generate(slave_id, register))
    }
}

// ============================================================================
// Tests
// ============================================================================
