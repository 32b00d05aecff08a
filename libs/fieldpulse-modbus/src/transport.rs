//! Transport abstraction
//!
//! `Transport` is the single seam between the acquisition engine and the
//! bus: open/close a link and run one request/response exchange at a time.
//! `ModbusTransport` drives real links; the synthetic variant lives in
//! `synthetic` and honors the same contract.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ModbusError, Result};
use crate::frame;
use crate::link::{LinkSettings, ModbusLink};

/// One shared bus: connect/disconnect and a single in-flight read request.
///
/// Connecting never retries internally. Reconnect and backoff policy belong
/// to the scheduling layer above.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying link, replacing any previous one.
    async fn connect(&self) -> Result<()>;

    /// Release the underlying link. Safe to call when never connected.
    async fn disconnect(&self) -> Result<()>;

    /// Whether a link is currently held.
    async fn is_connected(&self) -> bool;

    /// Issue one read and return the raw register/bit words.
    ///
    /// Register functions yield one word per register; bit functions yield
    /// one 0/1 word per point.
    async fn request(
        &self,
        slave_id: u8,
        function_code: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>>;

    /// Best-effort discard of stale receive data after a failed exchange.
    async fn flush(&self) -> Result<()>;
}

/// Production transport over a TCP, RTU-over-TCP or serial link.
///
/// The link lives behind a mutex held for the whole request/response
/// exchange, so overlapping callers serialize naturally. An exchange
/// abandoned by its caller leaves its late response in the receive path;
/// MBAP transaction ids let the next exchange discard it, and RTU exchanges
/// rely on `flush` plus CRC/address checks.
pub struct ModbusTransport {
    settings: LinkSettings,
    connect_timeout: Duration,
    link: Mutex<Option<ModbusLink>>,
    next_transaction: AtomicU16,
}

impl ModbusTransport {
    pub fn new(settings: LinkSettings, connect_timeout: Duration) -> Self {
        Self {
            settings,
            connect_timeout,
            link: Mutex::new(None),
            next_transaction: AtomicU16::new(0),
        }
    }

    /// Link description for logs.
    pub fn describe(&self) -> String {
        self.settings.to_string()
    }

    async fn exchange_rtu(
        link: &mut ModbusLink,
        slave_id: u8,
        pdu: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let request = frame::build_rtu_frame(slave_id, pdu);
        link.send(&request).await?;
        let raw = link.receive_rtu(timeout).await?;
        frame::parse_rtu_frame(&raw, slave_id)
    }

    async fn exchange_mbap(
        &self,
        link: &mut ModbusLink,
        slave_id: u8,
        pdu: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        let request = frame::build_tcp_frame(transaction_id, slave_id, pdu);
        link.send(&request).await?;

        // Responses to abandoned earlier requests may still arrive; skip
        // anything whose transaction id is not ours
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ModbusError::timeout("response timed out"));
            }
            let (header, response_pdu) = link.receive_mbap(deadline - now).await?;
            if header.transaction_id == transaction_id && header.unit_id == slave_id {
                return Ok(response_pdu);
            }
            debug!(
                "discarding stale frame: tid {} unit {} (awaiting tid {} unit {})",
                header.transaction_id, header.unit_id, transaction_id, slave_id
            );
        }
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.link.lock().await;
        // Drop any stale link first so a half-dead socket never lingers
        *guard = None;
        let link = ModbusLink::open(&self.settings, self.connect_timeout).await?;
        *guard = Some(link);
        info!("transport connected: {}", self.settings);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.link.lock().await;
        if guard.take().is_some() {
            debug!("transport disconnected: {}", self.settings);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    async fn request(
        &self,
        slave_id: u8,
        function_code: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>> {
        let pdu = frame::build_read_request(function_code, address, count)?;

        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ModbusError::NotConnected)?;

        let response_pdu = if link.uses_rtu_framing() {
            Self::exchange_rtu(link, slave_id, &pdu, timeout).await?
        } else {
            self.exchange_mbap(link, slave_id, &pdu, timeout).await?
        };

        frame::parse_read_response(&response_pdu, function_code, count)
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_mut() {
            link.drain().await;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
