//! Service assembly
//!
//! Builds one acquisition manager per configured port, wiring the real
//! transport/reader pair for physical links and the synthetic pair for
//! simulated ones. `--simulate` forces every port onto the synthetic pair.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use fieldpulse_modbus::{
    ModbusReader, ModbusTransport, RegisterSource, SyntheticReader, SyntheticTransport, Transport,
};

use crate::config::{AcquisitionConfig, AppConfig, PortConfig};
use crate::device::DeviceStatus;
use crate::error::Result;
use crate::manager::AcquisitionManager;
use crate::storage::{JsonlFileSink, RecordSink};

/// Per-port status projection
#[derive(Debug, Serialize)]
pub struct PortStatus {
    pub port: String,
    pub is_polling: bool,
    pub devices: Vec<DeviceStatus>,
}

/// The running service: one manager per port
pub struct AcquisitionService {
    managers: Vec<Arc<AcquisitionManager>>,
}

impl AcquisitionService {
    /// Build the per-port managers and register their devices. Nothing is
    /// connected or polled yet.
    pub async fn build(config: &AppConfig, simulate: bool) -> Result<Self> {
        let sink: Arc<dyn RecordSink> = Arc::new(JsonlFileSink::new(&config.storage.path));

        let mut managers = Vec::with_capacity(config.ports.len());
        for port in &config.ports {
            let manager = build_manager(port, &config.acquisition, sink.clone(), simulate);
            for device in &port.devices {
                manager.add_device(device).await?;
            }
            managers.push(Arc::new(manager));
        }

        info!(
            "service built: {} ports, {} devices, {} registers{}",
            config.ports.len(),
            config.device_count(),
            config.register_count(),
            if simulate { " (simulated)" } else { "" }
        );
        Ok(Self { managers })
    }

    /// Start the polling loop on every port.
    pub async fn start(&self) {
        for manager in &self.managers {
            manager.start_polling().await;
        }
    }

    /// Stop polling and saving everywhere and release every link.
    pub async fn shutdown(&self) {
        for manager in &self.managers {
            if let Err(err) = manager.disconnect().await {
                warn!("port {} shutdown error: {}", manager.port_name(), err);
            }
        }
        info!("service stopped");
    }

    /// Tear the running service down and rebuild it from a fresh config.
    pub async fn reload(self, config: &AppConfig, simulate: bool) -> Result<Self> {
        self.shutdown().await;
        let service = Self::build(config, simulate).await?;
        service.start().await;
        info!("service reloaded");
        Ok(service)
    }

    pub fn managers(&self) -> &[Arc<AcquisitionManager>] {
        &self.managers
    }

    /// Status projection across every port.
    pub async fn status(&self) -> Vec<PortStatus> {
        let mut ports = Vec::with_capacity(self.managers.len());
        for manager in &self.managers {
            ports.push(PortStatus {
                port: manager.port_name().to_string(),
                is_polling: manager.is_polling().await,
                devices: manager.devices_status().await,
            });
        }
        ports
    }
}

fn build_manager(
    port: &PortConfig,
    acquisition: &AcquisitionConfig,
    sink: Arc<dyn RecordSink>,
    simulate: bool,
) -> AcquisitionManager {
    let (transport, reader): (Arc<dyn Transport>, Arc<dyn RegisterSource>) =
        match port.connection.link_settings() {
            Some(settings) if !simulate => {
                info!("port {}: {}", port.name, settings);
                let transport = Arc::new(ModbusTransport::new(settings, port.connect_timeout()));
                let reader = Arc::new(ModbusReader::new(transport.clone()));
                (transport, reader)
            },
            _ => {
                info!("port {}: synthetic", port.name);
                (Arc::new(SyntheticTransport::new()), Arc::new(SyntheticReader::new()))
            },
        };

    AcquisitionManager::new(
        &port.name,
        transport,
        reader,
        sink,
        acquisition.poll_interval(),
        acquisition.reconnect_delay(),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use figment::providers::{Format, Yaml};
    use figment::Figment;
    use std::time::Duration;

    fn config(yaml: &str) -> AppConfig {
        AppConfig::extract(Figment::from(Yaml::string(yaml))).unwrap()
    }

    fn synthetic_config(storage: &std::path::Path) -> AppConfig {
        config(&format!(
            r"
acquisition:
  poll_interval_ms: 10
storage:
  path: {}
ports:
  - name: sim-a
    connection:
      type: synthetic
    devices:
      - slave_id: 1
        name: Meter A
        slug: meter-a
        registers:
          - name: voltage
            category: electrical
            address: 0
            function: holding
            data_type: uint16
  - name: sim-b
    connection:
      type: synthetic
    devices: []
",
            storage.display()
        ))
    }

    #[tokio::test]
    async fn test_build_creates_manager_per_port() {
        let dir = tempfile::tempdir().unwrap();
        let service = AcquisitionService::build(&synthetic_config(dir.path()), false)
            .await
            .unwrap();

        assert_eq!(service.managers().len(), 2);
        let status = service.status().await;
        assert_eq!(status[0].port, "sim-a");
        assert_eq!(status[0].devices.len(), 1);
        assert!(!status[0].is_polling);
        assert!(status[1].devices.is_empty());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_polling_fills_device_data() {
        let dir = tempfile::tempdir().unwrap();
        let service = AcquisitionService::build(&synthetic_config(dir.path()), false)
            .await
            .unwrap();

        service.start().await;
        assert!(service.status().await[0].is_polling);

        tokio::time::sleep(Duration::from_millis(500)).await;
        service.shutdown().await;

        let status = service.status().await;
        assert!(!status[0].is_polling);
        let device = &status[0].devices[0];
        assert!(device.last_success.is_some());
        assert!(device.data.contains_key("electrical"));
    }

    #[tokio::test]
    async fn test_simulate_overrides_physical_links() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r"
acquisition:
  poll_interval_ms: 10
storage:
  path: {}
ports:
  - name: real
    connection:
      type: tcp
      host: 192.0.2.1
      port: 502
    devices:
      - slave_id: 1
        name: Meter
        slug: meter
        registers:
          - name: voltage
            category: electrical
            address: 0
            function: holding
            data_type: uint16
",
            dir.path().display()
        );

        // With the synthetic override the unreachable host never matters
        let service = AcquisitionService::build(&config(&yaml), true).await.unwrap();
        service.start().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        service.shutdown().await;

        let status = service.status().await;
        assert!(status[0].devices[0].last_success.is_some());
    }

    #[tokio::test]
    async fn test_reload_rebuilds_managers() {
        let dir = tempfile::tempdir().unwrap();
        let service = AcquisitionService::build(&synthetic_config(dir.path()), false)
            .await
            .unwrap();
        service.start().await;

        let smaller = config(&format!(
            r"
storage:
  path: {}
ports:
  - name: sim-a
    connection:
      type: synthetic
    devices: []
",
            dir.path().display()
        ));
        let service = service.reload(&smaller, false).await.unwrap();

        let status = service.status().await;
        assert_eq!(status.len(), 1);
        assert!(status[0].is_polling);

        service.shutdown().await;
    }
}
