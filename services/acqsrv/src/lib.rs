//! FieldPulse Acquisition Service
//!
//! Polls Modbus field devices over TCP, RTU over TCP and serial RTU links,
//! turns raw registers into typed point snapshots, and persists them on
//! per-device save timers. Ports run independently; each gets its own
//! transport, polling loop and save timers.

pub mod bootstrap;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod poller;
pub mod saver;
pub mod service;
pub mod storage;

pub use config::AppConfig;
pub use error::{AcqError, Result};
pub use manager::AcquisitionManager;
pub use service::AcquisitionService;
