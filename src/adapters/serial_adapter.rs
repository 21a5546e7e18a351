//! Serial transport for RS-232/USB-Serial controllers
//!
//! Wraps the `serialport` crate and runs its blocking reads and writes on
//! Tokio's blocking task executor so that callers awaiting a response never
//! stall the runtime. The ESP300 talks 19200 baud, 8-N-1, with optional
//! RTS/CTS hardware flow control.

use super::{Transport, TransportKind};
use crate::error::{CommsError, CommsResult};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Serial transport for RS-232 communication
///
/// The read timeout is handed straight to the port as a `Duration`; there is
/// no unit conversion on this path.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 19200)
    baud_rate: u32,

    /// Hardware (RTS/CTS) flow control
    rts_cts: bool,

    /// Read timeout
    timeout: Duration,

    /// The open port (behind Arc<Mutex> so it can move onto a blocking thread)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("baud_rate", &self.baud_rate)
            .field("rts_cts", &self.rts_cts)
            .field("timeout", &self.timeout)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SerialTransport {
    /// Create a new, unopened serial transport
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 19200)
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            rts_cts: false,
            timeout: DEFAULT_SERIAL_TIMEOUT,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Set read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable RTS/CTS hardware flow control
    pub fn with_flow_control(mut self, rts_cts: bool) -> Self {
        self.rts_cts = rts_cts;
        self
    }

    /// Configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn open(&mut self) -> CommsResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.is_some() {
                return Ok(());
            }

            let flow_control = if self.rts_cts {
                serialport::FlowControl::Hardware
            } else {
                serialport::FlowControl::None
            };

            let port = serialport::new(&self.port_name, self.baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(flow_control)
                .timeout(self.timeout)
                .open()
                .map_err(|e| {
                    CommsError::Transport(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        self.port_name, self.baud_rate, e
                    ))
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));

            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(CommsError::Transport(
                "Serial support not enabled. Rebuild with --features instrument_serial"
                    .to_string(),
            ))
        }
    }

    async fn close(&mut self) -> CommsResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> CommsResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.as_ref().ok_or(CommsError::NotConnected)?;
            let port_clone = Arc::clone(port);
            let data = bytes.to_vec();
            let timeout = self.timeout;

            // Execute blocking serial I/O on dedicated thread
            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut port_guard = port_clone.blocking_lock();
                port_guard
                    .write_all(&data)
                    .and_then(|_| port_guard.flush())
                    .map_err(|e| CommsError::from_io(&e, timeout))
            })
            .await
            .map_err(|e| CommsError::Transport(format!("Serial I/O task failed: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = bytes;
            Err(CommsError::NotConnected)
        }
    }

    async fn read_until(&mut self, terminator: &[u8]) -> CommsResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.as_ref().ok_or(CommsError::NotConnected)?;
            let port_clone = Arc::clone(port);
            let terminator = terminator.to_vec();
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let mut port_guard = port_clone.blocking_lock();
                let mut response = Vec::new();
                let mut buffer = [0u8; 1];
                let deadline = std::time::Instant::now() + timeout;

                // One byte at a time so nothing past the terminator is consumed.
                loop {
                    if std::time::Instant::now() > deadline {
                        return Err(unterminated_or_timeout(&response, timeout));
                    }

                    match port_guard.read(&mut buffer) {
                        Ok(1) => {
                            response.push(buffer[0]);
                            if response.ends_with(&terminator) {
                                return Ok(response);
                            }
                        }
                        Ok(0) => {
                            return Err(CommsError::Transport(
                                "Unexpected EOF from serial port".to_string(),
                            ));
                        }
                        Ok(_) => {
                            return Err(CommsError::Transport(
                                "Single-byte read returned more than one byte".to_string(),
                            ));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            return Err(unterminated_or_timeout(&response, timeout));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(CommsError::from_io(&e, timeout)),
                    }
                }
            })
            .await
            .map_err(|e| CommsError::Transport(format!("Serial I/O task failed: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = terminator;
            Err(CommsError::NotConnected)
        }
    }

    async fn set_timeout(&mut self, timeout: Duration) -> CommsResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if let Some(port) = &self.port {
                port.lock()
                    .await
                    .set_timeout(timeout)
                    .map_err(|e| CommsError::Transport(format!("Failed to set timeout: {}", e)))?;
            }
        }
        self.timeout = timeout;
        Ok(())
    }
}

/// A silent line is a timeout; a line that went quiet mid-response is a protocol fault.
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
fn unterminated_or_timeout(partial: &[u8], timeout: Duration) -> CommsError {
    if partial.is_empty() {
        CommsError::Timeout(timeout)
    } else {
        CommsError::Protocol(format!(
            "Unterminated response after {:?}: {:?}",
            timeout,
            String::from_utf8_lossy(partial)
        ))
    }
}
