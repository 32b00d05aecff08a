//! Physical link handling
//!
//! One open link per transport: a TCP socket carrying MBAP frames, a TCP
//! socket tunneling RTU frames, or a local serial port. The link only moves
//! bytes; request/response pairing lives in the transport above it.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

#[cfg(feature = "rtu")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{ModbusError, Result};
use crate::frame::{self, MbapHeader, MBAP_HEADER_LEN};

/// Maximum PDU size per the Modbus specification (RS485 ADU limit of 256
/// bytes minus slave address and CRC).
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field: unit id + PDU.
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Receive buffer size: max frame is 260 bytes, 512 leaves margin.
const RESPONSE_BUFFER_SIZE: usize = 512;

/// Silence window that marks the end of an RTU response when the expected
/// length cannot be derived from the bytes received so far.
const RTU_INTER_BYTE_WINDOW: Duration = Duration::from_millis(50);

/// How a link is opened and framed.
#[derive(Debug, Clone)]
pub enum LinkSettings {
    /// Modbus TCP: MBAP framing over a socket
    Tcp { host: String, port: u16 },
    /// RTU framing tunneled over a socket
    RtuOverTcp { host: String, port: u16 },
    /// RTU framing over a local serial port
    #[cfg(feature = "rtu")]
    Rtu {
        device: String,
        baud_rate: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: String,
    },
}

impl std::fmt::Display for LinkSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkSettings::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            LinkSettings::RtuOverTcp { host, port } => write!(f, "rtu+tcp://{host}:{port}"),
            #[cfg(feature = "rtu")]
            LinkSettings::Rtu {
                device, baud_rate, ..
            } => write!(f, "rtu://{device}@{baud_rate}"),
        }
    }
}

/// An open physical or virtual link.
#[derive(Debug)]
pub enum ModbusLink {
    Tcp(TcpStream),
    RtuOverTcp(TcpStream),
    #[cfg(feature = "rtu")]
    Serial(SerialStream),
}

impl ModbusLink {
    /// Open a link per its settings. Never retries; reconnect policy
    /// belongs to the caller.
    pub async fn open(settings: &LinkSettings, connect_timeout: Duration) -> Result<Self> {
        match settings {
            LinkSettings::Tcp { host, port } => {
                let stream = Self::open_tcp(host, *port, connect_timeout).await?;
                Ok(ModbusLink::Tcp(stream))
            },
            LinkSettings::RtuOverTcp { host, port } => {
                let stream = Self::open_tcp(host, *port, connect_timeout).await?;
                Ok(ModbusLink::RtuOverTcp(stream))
            },
            #[cfg(feature = "rtu")]
            LinkSettings::Rtu {
                device,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
            } => Self::open_serial(device, *baud_rate, *data_bits, *stop_bits, parity),
        }
    }

    async fn open_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
        let addr = format!("{host}:{port}");
        debug!("TCP connecting: {}", addr);

        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                Ok(stream)
            },
            Ok(Err(e)) => Err(ModbusError::connection(format!(
                "failed to connect to {addr}: {e}"
            ))),
            Err(_) => Err(ModbusError::timeout(format!(
                "connection to {addr} timed out"
            ))),
        }
    }

    #[cfg(feature = "rtu")]
    fn open_serial(
        device: &str,
        baud_rate: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: &str,
    ) -> Result<Self> {
        debug!("RTU opening: {} @{}baud", device, baud_rate);

        let data_bits = match data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };

        match tokio_serial::new(device, baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
        {
            Ok(port) => {
                info!("RTU opened: {}", device);
                Ok(ModbusLink::Serial(port))
            },
            Err(e) => Err(ModbusError::connection(format!(
                "failed to open serial port {device}: {e}"
            ))),
        }
    }

    /// Whether this link carries RTU frames rather than MBAP.
    pub fn uses_rtu_framing(&self) -> bool {
        match self {
            ModbusLink::Tcp(_) => false,
            ModbusLink::RtuOverTcp(_) => true,
            #[cfg(feature = "rtu")]
            ModbusLink::Serial(_) => true,
        }
    }

    /// Write a complete frame to the link.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            ModbusLink::Tcp(stream) | ModbusLink::RtuOverTcp(stream) => {
                stream.write_all(data).await?;
            },
            #[cfg(feature = "rtu")]
            ModbusLink::Serial(port) => {
                port.write_all(data).await?;
                port.flush().await?;
            },
        }
        debug!("link TX: {}B", data.len());
        Ok(())
    }

    /// Receive one MBAP-framed response: header plus PDU.
    pub async fn receive_mbap(&mut self, timeout_duration: Duration) -> Result<(MbapHeader, Vec<u8>)> {
        let stream = match self {
            ModbusLink::Tcp(stream) => stream,
            _ => return Err(ModbusError::protocol("link does not carry MBAP frames")),
        };
        receive_mbap_from(stream, timeout_duration).await
    }

    /// Receive one RTU-framed response, complete with address and CRC.
    pub async fn receive_rtu(&mut self, timeout_duration: Duration) -> Result<Vec<u8>> {
        match self {
            ModbusLink::Tcp(_) => Err(ModbusError::protocol("link does not carry RTU frames")),
            ModbusLink::RtuOverTcp(stream) => receive_rtu_from(stream, timeout_duration).await,
            #[cfg(feature = "rtu")]
            ModbusLink::Serial(port) => receive_rtu_from(port, timeout_duration).await,
        }
    }

    /// Discard whatever is sitting in the receive path.
    ///
    /// Used after a failed or abandoned exchange so stale bytes cannot be
    /// mistaken for the next response. Returns the number of bytes dropped.
    pub async fn drain(&mut self) -> usize {
        match self {
            ModbusLink::Tcp(stream) | ModbusLink::RtuOverTcp(stream) => drain_from(stream).await,
            #[cfg(feature = "rtu")]
            ModbusLink::Serial(port) => drain_from(port).await,
        }
    }
}

async fn receive_mbap_from<S>(
    stream: &mut S,
    timeout_duration: Duration,
) -> Result<(MbapHeader, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; MBAP_HEADER_LEN];
    match timeout(timeout_duration, stream.read_exact(&mut header_bytes)).await {
        Ok(Ok(_)) => {},
        Ok(Err(e)) => return Err(map_closed(e, "header")),
        Err(_) => return Err(ModbusError::timeout("MBAP header read timed out")),
    }

    let header = MbapHeader::from_bytes(&header_bytes)?;
    if header.length as usize > MAX_MBAP_LENGTH {
        return Err(ModbusError::protocol(format!(
            "MBAP length {} exceeds maximum {MAX_MBAP_LENGTH}",
            header.length
        )));
    }

    let mut pdu = vec![0u8; header.pdu_length()];
    match timeout(timeout_duration, stream.read_exact(&mut pdu)).await {
        Ok(Ok(_)) => {},
        Ok(Err(e)) => return Err(map_closed(e, "PDU")),
        Err(_) => return Err(ModbusError::timeout("MBAP PDU read timed out")),
    }

    debug!("link RX: {}B", MBAP_HEADER_LEN + pdu.len());
    Ok((header, pdu))
}

async fn receive_rtu_from<S>(stream: &mut S, timeout_duration: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = [0u8; RESPONSE_BUFFER_SIZE];
    let mut total = 0usize;
    let deadline = Instant::now() + timeout_duration;

    loop {
        // Stop as soon as the bytes received so far form a complete frame
        if let Some(expected) = frame::expected_rtu_response_len(&buffer[..total]) {
            if total >= expected {
                debug!("link RX: {}B", expected);
                return Ok(buffer[..expected].to_vec());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ModbusError::timeout("RTU response timed out"));
        }
        let window = RTU_INTER_BYTE_WINDOW.min(deadline - now);

        match timeout(window, stream.read(&mut buffer[total..])).await {
            Ok(Ok(0)) => {
                return Err(ModbusError::connection("link closed while awaiting response"));
            },
            Ok(Ok(n)) => {
                total += n;
                if total >= buffer.len() {
                    return Err(ModbusError::protocol("RTU response exceeds buffer size"));
                }
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                // Silence on the line: either the frame is done or it never
                // finished arriving. CRC validation sorts out truncation.
                if total >= 4 {
                    debug!("link RX: {}B (gap)", total);
                    return Ok(buffer[..total].to_vec());
                }
                if total > 0 {
                    return Err(ModbusError::timeout("RTU response incomplete"));
                }
            },
        }
    }
}

async fn drain_from<S>(stream: &mut S) -> usize
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 256];
    let mut dropped = 0usize;
    while let Ok(Ok(n)) = timeout(Duration::from_millis(20), stream.read(&mut scratch)).await {
        if n == 0 {
            break;
        }
        dropped += n;
        if dropped >= 16 * 1024 {
            warn!("drain stopped after {}B of stale data", dropped);
            break;
        }
    }
    if dropped > 0 {
        debug!("drained {}B of stale data", dropped);
    }
    dropped
}

fn map_closed(e: std::io::Error, what: &str) -> ModbusError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ModbusError::connection(format!("link closed while reading {what}"))
    } else {
        e.into()
    }
}

// ============================================================================
// Tests
// ============================================================================
