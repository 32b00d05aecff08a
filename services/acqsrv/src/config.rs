//! Service configuration
//!
//! Layered loading in the usual order: built-in defaults, then the YAML
//! file, then `ACQSRV_`-prefixed environment variables (nested keys joined
//! with `__`, e.g. `ACQSRV_SERVICE__LOGGING__LEVEL=debug`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::warn;

use fieldpulse_modbus::{LinkSettings, RegisterDefinition};

use crate::error::{AcqError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/acqsrv.yaml";

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Physical ports, each carrying its own device list
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rolling log files; console only when unset
    pub dir: Option<PathBuf>,

    /// Emit JSON lines instead of the human-readable format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), dir: None, json: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Pause between full polling cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Wait before re-attempting a failed transport connect
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl AcquisitionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for JSONL record files, one file per device
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_storage_path() }
    }
}

/// One physical port (bus) and the devices attached to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,

    pub connection: ConnectionConfig,

    /// Transport connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl PortConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Link parameters for one port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionConfig {
    Tcp {
        host: String,
        port: u16,
    },
    RtuOverTcp {
        host: String,
        port: u16,
    },
    Rtu {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default = "default_parity")]
        parity: String,
    },
    /// No physical link; the port runs on the synthetic transport/reader pair
    Synthetic,
}

impl ConnectionConfig {
    pub fn is_synthetic(&self) -> bool {
        matches!(self, ConnectionConfig::Synthetic)
    }

    /// Link settings for the real transport; `None` for synthetic ports.
    pub fn link_settings(&self) -> Option<LinkSettings> {
        match self {
            ConnectionConfig::Tcp { host, port } => {
                Some(LinkSettings::Tcp { host: host.clone(), port: *port })
            },
            ConnectionConfig::RtuOverTcp { host, port } => {
                Some(LinkSettings::RtuOverTcp { host: host.clone(), port: *port })
            },
            ConnectionConfig::Rtu { device, baud_rate, data_bits, stop_bits, parity } => {
                Some(LinkSettings::Rtu {
                    device: device.clone(),
                    baud_rate: *baud_rate,
                    data_bits: *data_bits,
                    stop_bits: *stop_bits,
                    parity: parity.clone(),
                })
            },
            ConnectionConfig::Synthetic => None,
        }
    }
}

/// One field device on a port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Modbus unit/slave address, 1..=247
    pub slave_id: u8,

    /// Human-readable device name
    pub name: String,

    /// Stable identifier used by control-plane operations
    pub slug: String,

    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Per-request response timeout
    #[serde(default = "default_device_timeout")]
    pub timeout_ms: u64,

    /// Consecutive failures before the device is considered unresponsive
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Snapshot persistence period
    #[serde(default = "default_save_interval")]
    pub save_interval_ms: u64,

    #[serde(default)]
    pub registers: Vec<RegisterDefinition>,
}

impl DeviceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }
}

fn default_service_name() -> String {
    "acqsrv".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_reconnect_delay() -> u64 {
    5000
}
fn default_storage_path() -> PathBuf {
    PathBuf::from("data")
}
fn default_connect_timeout() -> u64 {
    5000
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_true() -> bool {
    true
}
fn default_device_timeout() -> u64 {
    1000
}
fn default_retries() -> u32 {
    3
}
fn default_save_interval() -> u64 {
    60_000
}

impl AppConfig {
    /// Load configuration from the YAML file and environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::new();
        if path.exists() {
            figment = figment.merge(Yaml::file(path));
        } else {
            warn!("config file {} not found, using defaults", path.display());
        }
        figment = figment.merge(Env::prefixed("ACQSRV_").split("__"));
        Self::extract(figment)
    }

    /// Extract and validate on top of the built-in defaults.
    pub fn extract(overlay: Figment) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(overlay)
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Synchronous sanity checks over the whole tree.
    pub fn validate(&self) -> Result<()> {
        if self.acquisition.poll_interval_ms == 0 {
            return Err(AcqError::validation("poll_interval_ms must be positive"));
        }

        for port in &self.ports {
            if port.name.is_empty() {
                return Err(AcqError::validation("port name must not be empty"));
            }
            validate_connection(&port.name, &port.connection)?;

            let mut slugs = Vec::new();
            let mut slave_ids = Vec::new();
            for device in &port.devices {
                validate_device(&port.name, device)?;
                if slugs.contains(&device.slug) {
                    return Err(AcqError::validation(format!(
                        "port '{}': duplicate device slug '{}'",
                        port.name, device.slug
                    )));
                }
                if slave_ids.contains(&device.slave_id) {
                    return Err(AcqError::validation(format!(
                        "port '{}': duplicate slave id {}",
                        port.name, device.slave_id
                    )));
                }
                slugs.push(device.slug.clone());
                slave_ids.push(device.slave_id);
            }
        }
        Ok(())
    }

    /// Total device count across all ports.
    pub fn device_count(&self) -> usize {
        self.ports.iter().map(|p| p.devices.len()).sum()
    }

    /// Total register count across all devices.
    pub fn register_count(&self) -> usize {
        self.ports
            .iter()
            .flat_map(|p| &p.devices)
            .map(|d| d.registers.len())
            .sum()
    }
}

fn validate_connection(port: &str, connection: &ConnectionConfig) -> Result<()> {
    if let ConnectionConfig::Rtu { device, baud_rate, data_bits, stop_bits, parity } = connection {
        if device.is_empty() {
            return Err(AcqError::validation(format!(
                "port '{port}': serial device path must not be empty"
            )));
        }
        if *baud_rate == 0 {
            return Err(AcqError::validation(format!("port '{port}': baud_rate must be positive")));
        }
        if !(5..=8).contains(data_bits) {
            return Err(AcqError::validation(format!(
                "port '{port}': data_bits {data_bits} outside 5..=8"
            )));
        }
        if !(1..=2).contains(stop_bits) {
            return Err(AcqError::validation(format!(
                "port '{port}': stop_bits {stop_bits} outside 1..=2"
            )));
        }
        if !matches!(parity.to_lowercase().as_str(), "none" | "even" | "odd") {
            return Err(AcqError::validation(format!(
                "port '{port}': parity '{parity}' not one of none/even/odd"
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_device(port: &str, device: &DeviceConfig) -> Result<()> {
    if device.slave_id == 0 || device.slave_id > 247 {
        return Err(AcqError::validation(format!(
            "port '{port}', device '{}': slave id {} outside 1..=247",
            device.slug, device.slave_id
        )));
    }
    if device.slug.is_empty() {
        return Err(AcqError::validation(format!(
            "port '{port}': device '{}' has an empty slug",
            device.name
        )));
    }
    if device.retries == 0 {
        return Err(AcqError::validation(format!(
            "port '{port}', device '{}': retries must be at least 1",
            device.slug
        )));
    }
    if device.save_interval_ms == 0 {
        return Err(AcqError::validation(format!(
            "port '{port}', device '{}': save_interval_ms must be positive",
            device.slug
        )));
    }
    for register in &device.registers {
        register.validate().map_err(|e| {
            AcqError::validation(format!(
                "port '{port}', device '{}', register '{}': {e}",
                device.slug, register.name
            ))
        })?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> Result<AppConfig> {
        AppConfig::extract(Figment::from(Yaml::string(yaml)))
    }

    // ========== Defaults ==========

    #[test]
    fn test_empty_config_gets_defaults() {
        let config = from_yaml("{}").unwrap();
        assert_eq!(config.service.name, "acqsrv");
        assert_eq!(config.service.logging.level, "info");
        assert_eq!(config.acquisition.poll_interval_ms, 1000);
        assert_eq!(config.acquisition.reconnect_delay_ms, 5000);
        assert_eq!(config.storage.path, PathBuf::from("data"));
        assert!(config.ports.is_empty());
    }

    #[test]
    fn test_device_defaults() {
        let config = from_yaml(
            r"
ports:
  - name: sim
    connection:
      type: synthetic
    devices:
      - slave_id: 1
        name: Meter
        slug: meter-1
",
        )
        .unwrap();

        let device = &config.ports[0].devices[0];
        assert!(device.is_active);
        assert_eq!(device.timeout_ms, 1000);
        assert_eq!(device.retries, 3);
        assert_eq!(device.save_interval_ms, 60_000);
        assert_eq!(device.timeout(), Duration::from_millis(1000));
    }

    // ========== Full tree ==========

    #[test]
    fn test_full_config_parses() {
        let config = from_yaml(
            r#"
service:
  name: acqsrv-east
  logging:
    level: debug
acquisition:
  poll_interval_ms: 2000
storage:
  path: /var/lib/acqsrv
ports:
  - name: tcp-main
    connection:
      type: tcp
      host: 10.0.0.5
      port: 502
    devices:
      - slave_id: 17
        name: Power Meter
        slug: pm-17
        timeout_ms: 750
        registers:
          - name: voltage
            category: electrical
            address: 100
            function: holding
            data_type: uint16
            scale: 0.1
            decimals: 1
            unit: V
            min_value: 200.0
            max_value: 250.0
  - name: rtu-field
    connection:
      type: rtu
      device: /dev/ttyUSB0
      baud_rate: 19200
      parity: even
    devices: []
"#,
        )
        .unwrap();

        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.device_count(), 1);
        assert_eq!(config.register_count(), 1);

        let register = &config.ports[0].devices[0].registers[0];
        assert_eq!(register.address, 100);
        assert!((register.scale - 0.1).abs() < f64::EPSILON);

        match &config.ports[1].connection {
            ConnectionConfig::Rtu { baud_rate, data_bits, stop_bits, parity, .. } => {
                assert_eq!(*baud_rate, 19200);
                assert_eq!(*data_bits, 8);
                assert_eq!(*stop_bits, 1);
                assert_eq!(parity, "even");
            },
            other => panic!("unexpected connection: {other:?}"),
        }
    }

    #[test]
    fn test_link_settings_conversion() {
        let tcp = ConnectionConfig::Tcp { host: "10.0.0.5".to_string(), port: 502 };
        assert!(matches!(tcp.link_settings(), Some(LinkSettings::Tcp { .. })));
        assert!(!tcp.is_synthetic());

        assert!(ConnectionConfig::Synthetic.link_settings().is_none());
        assert!(ConnectionConfig::Synthetic.is_synthetic());
    }

    // ========== Validation ==========

    #[test]
    fn test_slave_id_bounds_rejected() {
        for bad in [0u8, 248] {
            let yaml = format!(
                r"
ports:
  - name: sim
    connection:
      type: synthetic
    devices:
      - slave_id: {bad}
        name: Meter
        slug: meter
"
            );
            let err = from_yaml(&yaml).unwrap_err();
            assert!(err.to_string().contains("slave id"), "{err}");
        }
    }

    #[test]
    fn test_duplicate_slug_rejected() {
        let err = from_yaml(
            r"
ports:
  - name: sim
    connection:
      type: synthetic
    devices:
      - slave_id: 1
        name: A
        slug: meter
      - slave_id: 2
        name: B
        slug: meter
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate device slug"), "{err}");
    }

    #[test]
    fn test_bad_serial_parameters_rejected() {
        let err = from_yaml(
            r"
ports:
  - name: field
    connection:
      type: rtu
      device: /dev/ttyUSB0
      parity: mark
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("parity"), "{err}");

        let err = from_yaml(
            r"
ports:
  - name: field
    connection:
      type: rtu
      device: /dev/ttyUSB0
      data_bits: 9
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("data_bits"), "{err}");
    }

    #[test]
    fn test_invalid_register_rejected() {
        let err = from_yaml(
            r"
ports:
  - name: sim
    connection:
      type: synthetic
    devices:
      - slave_id: 1
        name: Meter
        slug: meter
        registers:
          - name: label
            category: general
            address: 5
            function: holding
            data_type: string
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("register 'label'"), "{err}");
    }

    #[test]
    fn test_zero_retries_rejected() {
        let err = from_yaml(
            r"
ports:
  - name: sim
    connection:
      type: synthetic
    devices:
      - slave_id: 1
        name: Meter
        slug: meter
        retries: 0
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("retries"), "{err}");
    }
}
