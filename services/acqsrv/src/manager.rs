//! Acquisition manager
//!
//! One manager per physical port. Owns the transport, the poller, the save
//! timers and the device list, and runs the polling loop: ensure the link is
//! up (with a reconnect delay on failure), run one cycle over every device,
//! wait out the poll interval, repeat. Stopping cancels the pending wait
//! rather than aborting mid-cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldpulse_modbus::{RegisterSource, Transport};

use crate::config::{self, DeviceConfig};
use crate::device::{Device, DeviceStatus};
use crate::error::{AcqError, Result};
use crate::poller::DevicePoller;
use crate::saver::DataSaver;
use crate::storage::RecordSink;

struct PollingTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-port acquisition runtime
pub struct AcquisitionManager {
    port_name: String,
    transport: Arc<dyn Transport>,
    poller: Arc<DevicePoller>,
    saver: Arc<DataSaver>,
    devices: Arc<RwLock<Vec<Arc<Device>>>>,
    poll_interval: Duration,
    reconnect_delay: Duration,
    polling: Mutex<Option<PollingTask>>,
}

impl AcquisitionManager {
    pub fn new(
        port_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        reader: Arc<dyn RegisterSource>,
        sink: Arc<dyn RecordSink>,
        poll_interval: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        let poller = Arc::new(DevicePoller::new(transport.clone(), reader));
        Self {
            port_name: port_name.into(),
            transport,
            poller,
            saver: Arc::new(DataSaver::new(sink)),
            devices: Arc::new(RwLock::new(Vec::new())),
            poll_interval,
            reconnect_delay,
            polling: Mutex::new(None),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open the transport link once; the polling loop keeps it alive.
    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await?;
        Ok(())
    }

    /// Tear the port down: polling first, then the save timers, then the
    /// link itself.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_polling().await;
        self.saver.stop_all_saving().await;
        self.transport.disconnect().await?;
        info!("port {} disconnected", self.port_name);
        Ok(())
    }

    /// Register a device on this port and start its save timer.
    pub async fn add_device(&self, config: &DeviceConfig) -> Result<()> {
        config::validate_device(&self.port_name, config)?;

        let mut devices = self.devices.write().await;
        if devices.iter().any(|d| d.slave_id == config.slave_id) {
            return Err(AcqError::validation(format!(
                "port '{}': slave id {} already registered",
                self.port_name, config.slave_id
            )));
        }
        if devices.iter().any(|d| d.slug == config.slug) {
            return Err(AcqError::validation(format!(
                "port '{}': device slug '{}' already registered",
                self.port_name, config.slug
            )));
        }

        let device = Arc::new(Device::new(config));
        self.saver.start_device_saving(device.clone());
        devices.push(device);
        info!(
            "device added: {} (slave {}) on port {}",
            config.slug, config.slave_id, self.port_name
        );
        Ok(())
    }

    /// Remove a device and stop its save timer. Returns false for an
    /// unknown slave id.
    pub async fn remove_device(&self, slave_id: u8) -> bool {
        let removed = {
            let mut devices = self.devices.write().await;
            match devices.iter().position(|d| d.slave_id == slave_id) {
                Some(index) => Some(devices.remove(index)),
                None => None,
            }
        };
        match removed {
            Some(device) => {
                self.saver.stop_device_saving(slave_id).await;
                info!("device removed: {} from port {}", device.slug, self.port_name);
                true
            },
            None => false,
        }
    }

    /// Update one device's enable flags. Returns false for an unknown slug.
    pub async fn update_device_status(
        &self,
        slug: &str,
        is_active: bool,
        port_is_active: bool,
    ) -> bool {
        let device = {
            let devices = self.devices.read().await;
            devices.iter().find(|d| d.slug == slug).cloned()
        };
        match device {
            Some(device) => {
                device.set_active(is_active, port_is_active).await;
                true
            },
            None => false,
        }
    }

    /// Fan a port-level enable flag out to every device.
    pub async fn update_port_status(&self, port_is_active: bool) {
        let devices = self.devices.read().await.clone();
        for device in devices {
            device.set_port_active(port_is_active).await;
        }
        info!(
            "port {} marked {}",
            self.port_name,
            if port_is_active { "active" } else { "inactive" }
        );
    }

    /// Read-only status projection of every device on the port.
    pub async fn devices_status(&self) -> Vec<DeviceStatus> {
        let devices = self.devices.read().await.clone();
        let mut statuses = Vec::with_capacity(devices.len());
        for device in devices {
            statuses.push(device.status().await);
        }
        statuses
    }

    pub async fn is_polling(&self) -> bool {
        self.polling.lock().await.is_some()
    }

    /// Start the polling loop. A second call while it runs is a no-op.
    pub async fn start_polling(&self) {
        let mut polling = self.polling.lock().await;
        if polling.is_some() {
            debug!("polling already running on port {}", self.port_name);
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            self.port_name.clone(),
            self.transport.clone(),
            self.poller.clone(),
            self.devices.clone(),
            self.poll_interval,
            self.reconnect_delay,
            cancel.clone(),
        ));
        *polling = Some(PollingTask { cancel, handle });
        info!("polling started on port {}", self.port_name);
    }

    /// Stop the polling loop, letting an in-flight cycle finish.
    pub async fn stop_polling(&self) {
        let task = self.polling.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
            info!("polling stopped on port {}", self.port_name);
        }
    }
}

async fn poll_loop(
    port_name: String,
    transport: Arc<dyn Transport>,
    poller: Arc<DevicePoller>,
    devices: Arc<RwLock<Vec<Arc<Device>>>>,
    poll_interval: Duration,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        if !transport.is_connected().await {
            if let Err(err) = transport.connect().await {
                warn!("port {port_name}: connect failed: {err}");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(reconnect_delay) => {},
                }
                continue;
            }
        }

        let list = devices.read().await.clone();
        poller.poll_all(&list).await;

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("poll loop on port {port_name} cancelled");
                return;
            },
            _ = sleep(poll_interval) => {},
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
