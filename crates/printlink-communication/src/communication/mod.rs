//! Communication layer
//!
//! - `serial`: the OS serial port transport and port discovery
//! - `link`: shared port ownership, the line read loop and telemetry
//! - `session`: baud discovery, handshake and session lifecycle
//! - `buffered`: one-in-flight command submission with acknowledgement
//!   tracking and retries

pub mod buffered;
pub mod link;
pub mod serial;
pub mod session;

use async_trait::async_trait;
use printlink_core::Result;
use std::io;

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

/// Parameters for opening a byte transport
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: SerialParity,
    /// Hardware (RTS/CTS) flow control
    pub flow_control: bool,
    /// Read timeout in milliseconds; kept short so the read loop stays responsive
    pub read_timeout_ms: u64,
}

impl ConnectionParams {
    /// 8 data bits, 1 stop bit, no parity, no flow control
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: false,
            read_timeout_ms: 10,
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self::serial("", 115200)
    }
}

/// Byte-level access to an open port
///
/// `read` returns `Ok(0)` or an `ErrorKind::TimedOut` error when nothing
/// arrived within the read timeout. Any other error means the device is gone.
pub trait Transport: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn name(&self) -> String;

    fn close(&mut self) -> io::Result<()>;
}

/// Opens transports for the session manager
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>>;
}
