//! Snapshot persistence timers
//!
//! One repeating timer task per device, fully decoupled from the poll
//! cadence. A tick persists the device's current snapshot unless there is
//! nothing worth saving. Persistence failures are logged and the timer
//! keeps running.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::storage::{RecordSink, SaveRecord};

struct SaverTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Schedules and owns the per-device save timers
pub struct DataSaver {
    sink: Arc<dyn RecordSink>,
    tasks: DashMap<u8, SaverTask>,
}

impl DataSaver {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink, tasks: DashMap::new() }
    }

    /// Start the save timer for a device. A device that already has one is
    /// left alone.
    pub fn start_device_saving(&self, device: Arc<Device>) {
        match self.tasks.entry(device.slave_id) {
            Entry::Occupied(_) => {
                debug!("device {} already has a save timer", device.slug);
            },
            Entry::Vacant(entry) => {
                let cancel = CancellationToken::new();
                let handle =
                    tokio::spawn(save_loop(device.clone(), self.sink.clone(), cancel.clone()));
                entry.insert(SaverTask { cancel, handle });
                info!(
                    "save timer started: {} every {}ms",
                    device.slug,
                    device.save_interval.as_millis()
                );
            },
        }
    }

    /// Stop one device's save timer; safe to call for an unknown device.
    pub async fn stop_device_saving(&self, slave_id: u8) {
        if let Some((_, task)) = self.tasks.remove(&slave_id) {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    /// Stop every save timer and wait for the tasks to finish.
    pub async fn stop_all_saving(&self) {
        let ids: Vec<u8> = self.tasks.iter().map(|entry| *entry.key()).collect();
        let mut handles = Vec::new();
        for id in ids {
            if let Some((_, task)) = self.tasks.remove(&id) {
                task.cancel.cancel();
                handles.push(task.handle);
            }
        }
        if !handles.is_empty() {
            let count = handles.len();
            futures::future::join_all(handles).await;
            info!("stopped {count} save timers");
        }
    }

    pub fn is_saving(&self, slave_id: u8) -> bool {
        self.tasks.contains_key(&slave_id)
    }
}

async fn save_loop(device: Arc<Device>, sink: Arc<dyn RecordSink>, cancel: CancellationToken) {
    // First fire one full interval after start, not immediately
    let mut ticker = interval_at(Instant::now() + device.save_interval, device.save_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("save timer stopped: {}", device.slug);
                return;
            },
            _ = ticker.tick() => {},
        }

        let Some(data) = device.save_snapshot().await else {
            debug!("device {} save skipped (no fresh data)", device.slug);
            continue;
        };
        let record = SaveRecord::new(device.slave_id, data);
        match sink.append(&device.slug, &record).await {
            Ok(()) => {
                device.mark_saved(Utc::now()).await;
                debug!("device {} snapshot saved", device.slug);
            },
            Err(err) => {
                warn!("device {} save failed: {}", device.slug, err);
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::{DeviceData, PointValue};
    use crate::error::{AcqError, Result};
    use crate::storage::MemorySink;
    use async_trait::async_trait;
    use fieldpulse_modbus::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn device(slave_id: u8, save_interval_ms: u64) -> Arc<Device> {
        Arc::new(Device::new(&DeviceConfig {
            slave_id,
            name: format!("Meter {slave_id}"),
            slug: format!("meter-{slave_id}"),
            is_active: true,
            timeout_ms: 100,
            retries: 3,
            save_interval_ms,
            registers: Vec::new(),
        }))
    }

    async fn load_data(device: &Device) {
        let mut points = BTreeMap::new();
        points.insert(
            "voltage".to_string(),
            PointValue { value: Value::Integer(231), unit: None, is_alarm: None },
        );
        let mut data = DeviceData::new();
        data.insert("electrical".to_string(), points);
        device.state.write().await.data = data;
    }

    /// Let spawned saver tasks run their pending iteration to completion.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance_and_settle(duration: Duration) {
        // Freshly spawned saver tasks must be polled once so they register
        // their interval before the paused clock moves.
        settle().await;
        tokio::time::advance(duration).await;
        settle().await;
    }

    struct FailingSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn append(&self, _slug: &str, _record: &SaveRecord) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AcqError::storage("disk full"))
        }
    }

    // ========== Timer cadence ==========

    #[tokio::test(start_paused = true)]
    async fn test_first_save_fires_after_one_interval() {
        let sink = Arc::new(MemorySink::new(16));
        let saver = DataSaver::new(sink.clone());
        let device = device(1, 60_000);
        load_data(&device).await;

        saver.start_device_saving(device.clone());
        settle().await;
        assert!(sink.is_empty().await);

        advance_and_settle(Duration::from_secs(59)).await;
        assert!(sink.is_empty().await);

        advance_and_settle(Duration::from_secs(2)).await;
        assert_eq!(sink.len().await, 1);

        let records = sink.records().await;
        assert_eq!(records[0].0, "meter-1");
        assert_eq!(records[0].1.slave_id, 1);
        assert!(device.status().await.last_save.is_some());

        saver.stop_all_saving().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_saves_repeat_every_interval() {
        let sink = Arc::new(MemorySink::new(16));
        let saver = DataSaver::new(sink.clone());
        let device = device(1, 60_000);
        load_data(&device).await;

        saver.start_device_saving(device);
        for _ in 0..3 {
            advance_and_settle(Duration::from_secs(61)).await;
        }
        assert_eq!(sink.len().await, 3);

        saver.stop_all_saving().await;
    }

    // ========== Skip rules ==========

    #[tokio::test(start_paused = true)]
    async fn test_save_skipped_without_data() {
        let sink = Arc::new(MemorySink::new(16));
        let saver = DataSaver::new(sink.clone());
        saver.start_device_saving(device(1, 60_000));

        advance_and_settle(Duration::from_secs(61)).await;
        assert!(sink.is_empty().await);

        saver.stop_all_saving().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_skipped_while_unresponsive() {
        let sink = Arc::new(MemorySink::new(16));
        let saver = DataSaver::new(sink.clone());
        let device = device(1, 60_000);
        load_data(&device).await;
        device.state.write().await.fail_count = 3;

        saver.start_device_saving(device.clone());
        advance_and_settle(Duration::from_secs(61)).await;
        assert!(sink.is_empty().await);

        // Recovery resumes saving with the same timer
        device.state.write().await.fail_count = 0;
        advance_and_settle(Duration::from_secs(61)).await;
        assert_eq!(sink.len().await, 1);

        saver.stop_all_saving().await;
    }

    // ========== Lifecycle ==========

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let sink = Arc::new(MemorySink::new(16));
        let saver = DataSaver::new(sink.clone());
        let device = device(1, 60_000);
        load_data(&device).await;

        saver.start_device_saving(device.clone());
        saver.start_device_saving(device);
        assert!(saver.is_saving(1));

        advance_and_settle(Duration::from_secs(61)).await;
        assert_eq!(sink.len().await, 1);

        saver.stop_all_saving().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_device_halts_its_timer() {
        let sink = Arc::new(MemorySink::new(16));
        let saver = DataSaver::new(sink.clone());
        let device = device(1, 60_000);
        load_data(&device).await;

        saver.start_device_saving(device);
        advance_and_settle(Duration::from_secs(61)).await;
        assert_eq!(sink.len().await, 1);

        saver.stop_device_saving(1).await;
        assert!(!saver.is_saving(1));
        advance_and_settle(Duration::from_secs(120)).await;
        assert_eq!(sink.len().await, 1);

        // Stopping an unknown device is a no-op
        saver.stop_device_saving(99).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_halts_every_timer() {
        let sink = Arc::new(MemorySink::new(16));
        let saver = DataSaver::new(sink.clone());
        for id in 1..=3u8 {
            let device = device(id, 60_000);
            load_data(&device).await;
            saver.start_device_saving(device);
        }

        advance_and_settle(Duration::from_secs(61)).await;
        assert_eq!(sink.len().await, 3);

        saver.stop_all_saving().await;
        assert!(!saver.is_saving(1));
        advance_and_settle(Duration::from_secs(120)).await;
        assert_eq!(sink.len().await, 3);
    }

    // ========== Sink failures ==========

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_keeps_timer_running() {
        let sink = Arc::new(FailingSink { attempts: AtomicUsize::new(0) });
        let saver = DataSaver::new(sink.clone());
        let device = device(1, 60_000);
        load_data(&device).await;

        saver.start_device_saving(device.clone());
        advance_and_settle(Duration::from_secs(61)).await;
        advance_and_settle(Duration::from_secs(61)).await;

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
        assert!(device.status().await.last_save.is_none());

        saver.stop_all_saving().await;
    }
}
