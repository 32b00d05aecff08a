//! Snapshot persistence
//!
//! Records are appended through the `RecordSink` trait so the backing store
//! is swappable. The default sink writes one JSON record per line into a
//! per-device `.jsonl` file; the in-memory sink backs tests.

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::device::DeviceData;
use crate::error::Result;

/// One persisted device snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SaveRecord {
    pub slave_id: u8,
    pub data: DeviceData,
    /// Local calendar date, `DD.MM.YYYY`
    pub date: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl SaveRecord {
    pub fn new(slave_id: u8, data: DeviceData) -> Self {
        Self {
            slave_id,
            data,
            date: record_date(Local::now()),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

pub fn record_date(now: DateTime<Local>) -> String {
    now.format("%d.%m.%Y").to_string()
}

/// Append-only destination for save records
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn append(&self, slug: &str, record: &SaveRecord) -> Result<()>;
}

/// JSONL file sink: one `<slug>.jsonl` file per device under a root
/// directory, created on demand.
pub struct JsonlFileSink {
    root: PathBuf,
}

impl JsonlFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_path(&self, slug: &str) -> PathBuf {
        self.root.join(format!("{slug}.jsonl"))
    }
}

#[async_trait]
impl RecordSink for JsonlFileSink {
    async fn append(&self, slug: &str, record: &SaveRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let path = self.file_path(slug);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!("record appended: {} ({}B)", path.display(), line.len());
        Ok(())
    }
}

/// In-memory sink for tests, bounded to the most recent records
pub struct MemorySink {
    records: Mutex<VecDeque<(String, SaveRecord)>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self { records: Mutex::new(VecDeque::new()), capacity }
    }

    pub async fn records(&self) -> Vec<(String, SaveRecord)> {
        self.records.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn append(&self, slug: &str, record: &SaveRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back((slug.to_string(), record.clone()));
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
