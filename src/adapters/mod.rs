//! Transport implementations
//!
//! This module contains the [`Transport`] trait and its implementations,
//! providing low-level byte I/O over the two links the ESP300 supports:
//! an RS-232 line ([`SerialTransport`]) and a VISA bus resource
//! ([`BusTransport`], e.g. GPIB). [`MockTransport`] stands in for hardware in
//! tests.
//!
//! The concrete transport is chosen once, when a session connects. Nothing
//! above this layer inspects which kind is in use; the only thing that differs
//! is the [`Framing`] the transport reports.

pub mod mock_adapter;
pub mod serial_adapter;
pub mod visa_adapter;

pub use mock_adapter::MockTransport;
pub use serial_adapter::SerialTransport;
pub use visa_adapter::BusTransport;

use crate::codec::Framing;
use crate::error::{CommsError, CommsResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Baud rate the ESP300 ships configured for.
pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// Which physical link a transport drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// RS-232 serial line.
    Serial,
    /// VISA instrument bus (GPIB and friends).
    Bus,
}

impl TransportKind {
    /// Where message termination is applied for this link.
    pub const fn framing(self) -> Framing {
        match self {
            TransportKind::Serial => Framing::Serial,
            TransportKind::Bus => Framing::Bus,
        }
    }

    /// Pause between closing and reopening the link during a reconnect.
    ///
    /// Bus resources take longer to tear down than a tty.
    pub const fn reconnect_backoff(self) -> Duration {
        match self {
            TransportKind::Serial => Duration::from_secs(2),
            TransportKind::Bus => Duration::from_secs(5),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("serial"),
            TransportKind::Bus => f.write_str("bus"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(TransportKind::Serial),
            "bus" | "gpib" | "visa" => Ok(TransportKind::Bus),
            other => Err(format!("Unknown transport kind '{}' (expected serial or bus)", other)),
        }
    }
}

/// A byte channel to the controller.
///
/// A transport is owned by exactly one `DeviceSession`; all methods take
/// `&mut self` and the session serializes access.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// The link this transport drives.
    fn kind(&self) -> TransportKind;

    /// Human readable address (port path or resource string).
    fn name(&self) -> &str;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Where message termination is applied.
    fn framing(&self) -> Framing {
        self.kind().framing()
    }

    /// Open the link. Opening an open link is a no-op.
    async fn open(&mut self) -> CommsResult<()>;

    /// Close the link. Closing a closed link is a no-op.
    async fn close(&mut self) -> CommsResult<()>;

    /// Send bytes, already framed by the codec.
    async fn write(&mut self, bytes: &[u8]) -> CommsResult<()>;

    /// Block until `terminator` is seen, returning everything read including it.
    ///
    /// Fails with `CommsError::Timeout` if nothing arrives within the read
    /// timeout, and `CommsError::Protocol` if data arrives but the
    /// terminator never does.
    async fn read_until(&mut self, terminator: &[u8]) -> CommsResult<Vec<u8>>;

    /// Change the read timeout, applied in the link's native unit.
    async fn set_timeout(&mut self, timeout: Duration) -> CommsResult<()>;
}

/// Build an unopened transport for `kind` at `address`.
///
/// Serial addresses may carry a baud rate as `path@baud`
/// (e.g. `/dev/ttyUSB0@9600`); otherwise 19200 baud is used. `rts_cts`
/// enables hardware flow control on serial links and is ignored on the bus.
pub fn build_transport(
    kind: TransportKind,
    address: &str,
    timeout: Duration,
    rts_cts: bool,
) -> CommsResult<Box<dyn Transport>> {
    if address.trim().is_empty() {
        return Err(CommsError::Transport("Empty transport address".to_string()));
    }

    match kind {
        TransportKind::Serial => {
            let (path, baud_rate) = split_serial_address(address)?;
            if path.trim().is_empty() {
                return Err(CommsError::Transport(format!(
                    "Serial address '{}' names no port",
                    address
                )));
            }
            Ok(Box::new(
                SerialTransport::new(path.to_string(), baud_rate)
                    .with_flow_control(rts_cts)
                    .with_timeout(timeout),
            ))
        }
        TransportKind::Bus => Ok(Box::new(
            BusTransport::new(address.to_string())
                .with_timeout(timeout)
                .with_terminations(
                    kind.framing().write_terminator(),
                    kind.framing().read_terminator(),
                ),
        )),
    }
}

fn split_serial_address(address: &str) -> CommsResult<(&str, u32)> {
    match address.rsplit_once('@') {
        Some((path, baud)) => {
            let baud_rate = baud.parse::<u32>().map_err(|_| {
                CommsError::Transport(format!("Invalid baud rate in serial address '{}'", address))
            })?;
            Ok((path, baud_rate))
        }
        None => Ok((address, DEFAULT_BAUD_RATE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("serial".parse::<TransportKind>(), Ok(TransportKind::Serial));
        assert_eq!("GPIB".parse::<TransportKind>(), Ok(TransportKind::Bus));
        assert!("usb".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_backoff_per_kind() {
        assert_eq!(TransportKind::Serial.reconnect_backoff(), Duration::from_secs(2));
        assert_eq!(TransportKind::Bus.reconnect_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_serial_address_with_baud() {
        assert_eq!(
            split_serial_address("/dev/ttyUSB1@9600").unwrap(),
            ("/dev/ttyUSB1", 9600)
        );
        assert_eq!(
            split_serial_address("/dev/ttyUSB0").unwrap(),
            ("/dev/ttyUSB0", DEFAULT_BAUD_RATE)
        );
        assert!(split_serial_address("/dev/ttyUSB0@fast").is_err());
    }

    #[test]
    fn test_build_transport_resolves_kind_once() {
        let serial =
            build_transport(TransportKind::Serial, "/dev/ttyUSB0", Duration::from_secs(5), true)
                .unwrap();
        assert_eq!(serial.kind(), TransportKind::Serial);
        assert_eq!(serial.framing(), Framing::Serial);
        assert!(!serial.is_open());

        let bus =
            build_transport(TransportKind::Bus, "GPIB0::5::INSTR", Duration::from_secs(5), true)
                .unwrap();
        assert_eq!(bus.kind(), TransportKind::Bus);
        assert_eq!(bus.name(), "GPIB0::5::INSTR");
        assert_eq!(bus.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_build_transport_rejects_empty_address() {
        assert!(build_transport(TransportKind::Bus, "  ", Duration::from_secs(1), false).is_err());
        assert!(
            build_transport(TransportKind::Serial, "@9600", Duration::from_secs(1), false).is_err()
        );
    }
}
