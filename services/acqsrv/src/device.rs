//! Device runtime model
//!
//! Immutable device parameters from configuration plus the mutable runtime
//! state behind a per-device lock. The poller is the only writer; savers and
//! status queries read. Locks are held only for the copy in or out, never
//! across I/O.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use fieldpulse_modbus::{RegisterDefinition, Value};

use crate::config::DeviceConfig;

/// One decoded point in a device snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointValue {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_alarm: Option<bool>,
}

/// Device snapshot grouped by category, then register name.
///
/// Ordered maps keep serialized records byte-stable across runs.
pub type DeviceData = BTreeMap<String, BTreeMap<String, PointValue>>;

/// Mutable runtime state, guarded by the device lock
#[derive(Debug)]
pub struct DeviceState {
    /// Device-level enable flag from the control plane
    pub is_active: bool,
    /// Port-level enable flag, fanned out to every device on the port
    pub port_is_active: bool,
    /// Consecutive failed poll cycles
    pub fail_count: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_save: Option<DateTime<Utc>>,
    /// Monotonic stamp of the last circuit-open re-attempt
    pub last_retry_attempt: Option<Instant>,
    /// Last complete snapshot; kept intact while the device is down
    pub data: DeviceData,
}

impl DeviceState {
    fn new(is_active: bool) -> Self {
        Self {
            is_active,
            port_is_active: true,
            fail_count: 0,
            last_success: None,
            last_error: None,
            last_save: None,
            last_retry_attempt: None,
            data: DeviceData::new(),
        }
    }
}

/// One field device: immutable parameters plus locked runtime state
#[derive(Debug)]
pub struct Device {
    pub slave_id: u8,
    pub name: String,
    pub slug: String,
    pub timeout: Duration,
    pub retries: u32,
    pub save_interval: Duration,
    pub registers: Vec<RegisterDefinition>,
    pub state: RwLock<DeviceState>,
}

impl Device {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            slave_id: config.slave_id,
            name: config.name.clone(),
            slug: config.slug.clone(),
            timeout: config.timeout(),
            retries: config.retries,
            save_interval: config.save_interval(),
            registers: config.registers.clone(),
            state: RwLock::new(DeviceState::new(config.is_active)),
        }
    }

    /// Read-only projection for the control plane.
    pub async fn status(&self) -> DeviceStatus {
        let state = self.state.read().await;
        DeviceStatus {
            slug: self.slug.clone(),
            name: self.name.clone(),
            slave_id: self.slave_id,
            is_active: state.is_active,
            port_is_active: state.port_is_active,
            fail_count: state.fail_count,
            is_responding: state.fail_count < self.retries,
            last_success: state.last_success,
            last_save: state.last_save,
            last_error: state.last_error.clone(),
            data: state.data.clone(),
        }
    }

    pub async fn set_active(&self, is_active: bool, port_is_active: bool) {
        let mut state = self.state.write().await;
        state.is_active = is_active;
        state.port_is_active = port_is_active;
    }

    pub async fn set_port_active(&self, port_is_active: bool) {
        self.state.write().await.port_is_active = port_is_active;
    }

    /// Snapshot for persistence, or `None` when there is nothing worth
    /// saving (no data yet, or the device is currently unresponsive).
    pub async fn save_snapshot(&self) -> Option<DeviceData> {
        let state = self.state.read().await;
        if state.data.is_empty() || state.fail_count >= self.retries {
            return None;
        }
        Some(state.data.clone())
    }

    pub async fn mark_saved(&self, at: DateTime<Utc>) {
        self.state.write().await.last_save = Some(at);
    }
}

/// Serialized device status for the external control plane
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub slug: String,
    pub name: String,
    pub slave_id: u8,
    pub is_active: bool,
    pub port_is_active: bool,
    pub fail_count: u32,
    pub is_responding: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_save: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub data: DeviceData,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn device_config(slave_id: u8) -> DeviceConfig {
        DeviceConfig {
            slave_id,
            name: format!("Meter {slave_id}"),
            slug: format!("meter-{slave_id}"),
            is_active: true,
            timeout_ms: 500,
            retries: 3,
            save_interval_ms: 60_000,
            registers: Vec::new(),
        }
    }

    fn sample_data() -> DeviceData {
        let mut points = BTreeMap::new();
        points.insert(
            "voltage".to_string(),
            PointValue {
                value: Value::Float(231.4),
                unit: Some("V".to_string()),
                is_alarm: Some(false),
            },
        );
        let mut data = DeviceData::new();
        data.insert("electrical".to_string(), points);
        data
    }

    // ========== Status projection ==========

    #[tokio::test]
    async fn test_fresh_device_is_responding() {
        let device = Device::new(&device_config(5));
        let status = device.status().await;
        assert_eq!(status.slave_id, 5);
        assert!(status.is_active);
        assert!(status.port_is_active);
        assert_eq!(status.fail_count, 0);
        assert!(status.is_responding);
        assert!(status.last_success.is_none());
        assert!(status.data.is_empty());
    }

    #[tokio::test]
    async fn test_responding_tracks_fail_count_against_retries() {
        let device = Device::new(&device_config(5));

        device.state.write().await.fail_count = 2;
        assert!(device.status().await.is_responding);

        device.state.write().await.fail_count = 3;
        assert!(!device.status().await.is_responding);
    }

    #[tokio::test]
    async fn test_set_active_updates_both_flags() {
        let device = Device::new(&device_config(1));
        device.set_active(false, true).await;

        let status = device.status().await;
        assert!(!status.is_active);
        assert!(status.port_is_active);

        device.set_port_active(false).await;
        assert!(!device.status().await.port_is_active);
    }

    // ========== Save snapshot gating ==========

    #[tokio::test]
    async fn test_save_snapshot_skips_empty_data() {
        let device = Device::new(&device_config(1));
        assert!(device.save_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_save_snapshot_skips_unresponsive_device() {
        let device = Device::new(&device_config(1));
        {
            let mut state = device.state.write().await;
            state.data = sample_data();
            state.fail_count = 3;
        }
        assert!(device.save_snapshot().await.is_none());

        device.state.write().await.fail_count = 2;
        assert!(device.save_snapshot().await.is_some());
    }

    // ========== Serialization ==========

    #[test]
    fn test_point_value_omits_absent_fields() {
        let bare = PointValue { value: Value::Integer(7), unit: None, is_alarm: None };
        assert_eq!(serde_json::to_string(&bare).unwrap(), r#"{"value":7}"#);

        let full = PointValue {
            value: Value::Float(25.5),
            unit: Some("C".to_string()),
            is_alarm: Some(true),
        };
        let json = serde_json::to_string(&full).unwrap();
        assert!(json.contains(r#""unit":"C""#));
        assert!(json.contains(r#""is_alarm":true"#));
    }
}
