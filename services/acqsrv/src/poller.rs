//! Device polling
//!
//! One poll cycle walks the device list strictly in order and reads each
//! device's registers sequentially over the shared transport. A device whose
//! first register fails is declared failed for the cycle immediately;
//! failures on later registers only drop that point from the snapshot. An
//! unresponsive device (fail count at or past its retry limit) is only
//! re-attempted once per holdoff window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fieldpulse_modbus::{RegisterDefinition, RegisterSource, Transport, Value};

use crate::device::{Device, DeviceData, PointValue};

/// Holdoff between re-attempts of an unresponsive device.
const RETRY_HOLDOFF: Duration = Duration::from_secs(60);

/// Pause after each device in a cycle.
const DEVICE_PACING: Duration = Duration::from_millis(100);

/// Longer pause after a device whose failure was link-level, giving the
/// bus a moment to settle.
const FAULT_PACING: Duration = Duration::from_millis(200);

/// Result of one device poll attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Device inactive, port inactive, or held off
    Skipped,
    /// Snapshot rebuilt
    Success,
    /// Poll failed; `link_fault` when the failure was link-level
    Failed { link_fault: bool },
}

/// Polls devices over a shared transport/reader pair
pub struct DevicePoller {
    transport: Arc<dyn Transport>,
    reader: Arc<dyn RegisterSource>,
}

impl DevicePoller {
    pub fn new(transport: Arc<dyn Transport>, reader: Arc<dyn RegisterSource>) -> Self {
        Self { transport, reader }
    }

    /// Run one full cycle over the device list, never in parallel.
    pub async fn poll_all(&self, devices: &[Arc<Device>]) {
        if devices.is_empty() {
            return;
        }
        if !self.transport.is_connected().await {
            debug!("poll cycle skipped: transport disconnected");
            return;
        }

        for device in devices {
            let outcome = self.poll_device(device).await;
            let pacing = match outcome {
                PollOutcome::Failed { link_fault: true } => FAULT_PACING,
                _ => DEVICE_PACING,
            };
            tokio::time::sleep(pacing).await;
        }
    }

    /// Poll a single device and update its state.
    pub async fn poll_device(&self, device: &Device) -> PollOutcome {
        {
            let state = device.state.read().await;
            if !state.is_active || !state.port_is_active {
                debug!("device {} skipped (inactive)", device.slug);
                return PollOutcome::Skipped;
            }
            if state.fail_count >= device.retries {
                if let Some(last_attempt) = state.last_retry_attempt {
                    if last_attempt.elapsed() < RETRY_HOLDOFF {
                        debug!("device {} unresponsive, holding off", device.slug);
                        return PollOutcome::Skipped;
                    }
                }
                drop(state);
                device.state.write().await.last_retry_attempt = Some(Instant::now());
                debug!("device {} re-attempted after holdoff", device.slug);
            }
        }

        let mut data = DeviceData::new();
        for (index, register) in device.registers.iter().enumerate() {
            match self.reader.read(device.slave_id, device.timeout, register).await {
                Ok(value) => {
                    let is_alarm = alarm_flag(register, &value);
                    data.entry(register.category.clone()).or_default().insert(
                        register.name.clone(),
                        PointValue { value, unit: register.unit.clone(), is_alarm },
                    );
                },
                Err(err) if index == 0 => {
                    // A dead first register means a dead device; don't burn
                    // a timeout per register on it.
                    warn!("device {} poll failed at '{}': {}", device.slug, register.name, err);
                    let link_fault = err.is_link_fault();
                    let mut state = device.state.write().await;
                    state.fail_count += 1;
                    state.last_error = Some(err.to_string());
                    return PollOutcome::Failed { link_fault };
                },
                Err(err) => {
                    warn!("device {}: register '{}' read failed: {}", device.slug, register.name, err);
                },
            }
        }

        let point_count: usize = data.values().map(|points| points.len()).sum();
        let previous_failures;
        {
            let mut state = device.state.write().await;
            previous_failures = state.fail_count;
            state.data = data;
            state.fail_count = 0;
            state.last_success = Some(Utc::now());
            state.last_error = None;
        }
        if previous_failures > 0 {
            info!("device {} recovered after {} failed cycles", device.slug, previous_failures);
        }
        debug!("device {} polled: {} points", device.slug, point_count);
        PollOutcome::Success
    }
}

/// Alarm flag for a decoded value, `None` when the register carries no
/// bounds or the value is not numeric. A composite checks every half the
/// display mode surfaced.
fn alarm_flag(register: &RegisterDefinition, value: &Value) -> Option<bool> {
    if !register.has_alarm_bounds() {
        return None;
    }
    match value {
        Value::Composite { int32, float32 } => {
            Some(register.exceeds_bounds(*int32) || register.exceeds_bounds(*float32))
        },
        other => other.as_f64().map(|v| register.exceeds_bounds(v)),
    }
}

// ============================================================================
// Tests
// ============================================================================
