//! VISA bus transport for GPIB-attached controllers
//!
//! Provides a [`Transport`] over a VISA resource (typically
//! `GPIB0::<addr>::INSTR`). VISA calls are synchronous, so every read and
//! write runs on Tokio's blocking task executor.
//!
//! Unlike the serial path, message termination is owned by this transport:
//! the codec hands over bare command text and the write terminator is
//! appended here. Responses are read up to the read terminator fixed when the
//! transport was built, not the one passed per call.

use super::{Transport, TransportKind};
use crate::error::{CommsError, CommsResult};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

const DEFAULT_BUS_TIMEOUT: Duration = Duration::from_secs(5);

/// VISA transport for bus-attached controllers
///
/// Supports resource strings like:
/// - "GPIB0::1::INSTR" (GPIB interface)
/// - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
/// - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
pub struct BusTransport {
    /// VISA resource string (e.g., "GPIB0::1::INSTR")
    resource: String,

    /// Read/write timeout, applied to the session in milliseconds
    timeout: Duration,

    /// Appended to every outgoing message
    write_termination: &'static str,

    /// Marks the end of every incoming message
    read_termination: &'static str,

    /// The open VISA session (behind Arc<Mutex> so it can move onto a blocking thread)
    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<Instrument>>>,
}

impl std::fmt::Debug for BusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusTransport")
            .field("resource", &self.resource)
            .field("timeout", &self.timeout)
            .field("write_termination", &self.write_termination)
            .field("read_termination", &self.read_termination)
            .field("open", &self.is_open())
            .finish()
    }
}

impl BusTransport {
    /// Create a new, unopened bus transport
    ///
    /// # Arguments
    /// * `resource` - VISA resource identifier (e.g., "GPIB0::1::INSTR")
    pub fn new(resource: String) -> Self {
        Self {
            resource,
            timeout: DEFAULT_BUS_TIMEOUT,
            write_termination: "\r",
            read_termination: "\r\n",
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the write and read termination sequences
    pub fn with_terminations(mut self, write: &'static str, read: &'static str) -> Self {
        self.write_termination = write;
        self.read_termination = read;
        self
    }

    /// Terminator every response is read up to
    pub fn read_termination(&self) -> &str {
        self.read_termination
    }

    /// Timeout in the unit VISA expects.
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    fn timeout_ms(&self) -> u32 {
        u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX)
    }
}

#[async_trait]
impl Transport for BusTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bus
    }

    fn name(&self) -> &str {
        &self.resource
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.instrument.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn open(&mut self) -> CommsResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.instrument.is_some() {
                return Ok(());
            }

            let resource = self.resource.clone();
            let timeout_ms = self.timeout_ms();

            let instrument = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new().map_err(|e| {
                    CommsError::Transport(format!("Failed to create VISA resource manager: {}", e))
                })?;

                let c_string = std::ffi::CString::new(resource.as_str()).map_err(|e| {
                    CommsError::Transport(format!("Invalid VISA resource '{}': {}", resource, e))
                })?;
                let instr = rm
                    .open(&c_string.into(), AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                    .map_err(|e| {
                        CommsError::Transport(format!(
                            "Failed to open VISA resource '{}': {}",
                            resource, e
                        ))
                    })?;

                apply_timeout(&instr, timeout_ms)?;
                Ok::<Instrument, CommsError>(instr)
            })
            .await
            .map_err(|e| CommsError::Transport(format!("VISA open task failed: {}", e)))??;

            self.instrument = Some(Arc::new(Mutex::new(instrument)));

            debug!(
                "VISA resource '{}' opened with {}ms timeout",
                self.resource,
                self.timeout_ms()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(CommsError::Transport(
                "VISA support not enabled. Rebuild with --features instrument_visa".to_string(),
            ))
        }
    }

    async fn close(&mut self) -> CommsResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.instrument.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource);
            }
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> CommsResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let instrument = self.instrument.as_ref().ok_or(CommsError::NotConnected)?;
            let instrument_clone = Arc::clone(instrument);
            let mut data = bytes.to_vec();
            if !data.ends_with(self.write_termination.as_bytes()) {
                data.extend_from_slice(self.write_termination.as_bytes());
            }
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let instr_guard = instrument_clone.blocking_lock();
                (&*instr_guard)
                    .write_all(&data)
                    .map_err(|e| visa_io_error(&e, timeout))
            })
            .await
            .map_err(|e| CommsError::Transport(format!("VISA write task failed: {}", e)))?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = bytes;
            Err(CommsError::NotConnected)
        }
    }

    async fn read_until(&mut self, _terminator: &[u8]) -> CommsResult<Vec<u8>> {
        #[cfg(feature = "instrument_visa")]
        {
            let instrument = self.instrument.as_ref().ok_or(CommsError::NotConnected)?;
            let instrument_clone = Arc::clone(instrument);
            let terminator = self.read_termination.as_bytes().to_vec();
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let instr_guard = instrument_clone.blocking_lock();
                let mut response = Vec::new();
                let mut buffer = [0u8; 256];

                loop {
                    match (&*instr_guard).read(&mut buffer) {
                        Ok(0) => {
                            return Err(if response.is_empty() {
                                CommsError::Timeout(timeout)
                            } else {
                                CommsError::Protocol(format!(
                                    "Unterminated response: {:?}",
                                    String::from_utf8_lossy(&response)
                                ))
                            });
                        }
                        Ok(n) => {
                            response.extend_from_slice(&buffer[..n]);
                            if response.ends_with(&terminator) {
                                return Ok(response);
                            }
                        }
                        Err(e) => return Err(visa_io_error(&e, timeout)),
                    }
                }
            })
            .await
            .map_err(|e| CommsError::Transport(format!("VISA read task failed: {}", e)))?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(CommsError::NotConnected)
        }
    }

    async fn set_timeout(&mut self, timeout: Duration) -> CommsResult<()> {
        self.timeout = timeout;

        #[cfg(feature = "instrument_visa")]
        {
            if let Some(instrument) = &self.instrument {
                let guard = instrument.lock().await;
                apply_timeout(&guard, self.timeout_ms())?;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "instrument_visa")]
fn apply_timeout(instrument: &Instrument, timeout_ms: u32) -> CommsResult<()> {
    let attr = visa_rs::attribute::AttrTmoValue::new_checked(timeout_ms).ok_or_else(|| {
        CommsError::Transport(format!("VISA rejected timeout of {}ms", timeout_ms))
    })?;
    instrument
        .set_attr(attr)
        .map_err(|e| CommsError::Transport(format!("Failed to set VISA timeout: {}", e)))
}

/// VISA reports its timeout (VI_ERROR_TMO) through a generic I/O error.
#[cfg(feature = "instrument_visa")]
fn visa_io_error(err: &std::io::Error, timeout: Duration) -> CommsError {
    if err.to_string().contains("TMO") {
        CommsError::Timeout(timeout)
    } else {
        CommsError::from_io(err, timeout)
    }
}
