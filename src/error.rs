//! Error types for the ESP300 driver.
//!
//! This module defines `CommsError`, the single error type returned by every
//! transport, session and axis operation. Using the `thiserror` crate it keeps
//! the failure kinds a caller can act on separate and explicit:
//!
//! - **`Transport`**: I/O failure on the physical link (port vanished, write
//!   rejected, reopen failed during a reconnect).
//! - **`Timeout`**: the controller did not answer within the configured window.
//! - **`Protocol`**: a response arrived but was malformed (not UTF-8,
//!   unterminated, or not the value the command grammar promises).
//! - **`NotConnected`**: the session has no open link, either because it was
//!   never connected, was disconnected, or a reconnect attempt failed.
//! - **`AxisBusy`**: a move was refused because the axis is still moving and
//!   the controller is configured with `MovePolicy::RefuseWhileMoving`.
//!
//! Programmer misuse, such as building an axis id of zero, is reported through
//! the separate `InvalidAxisId` type and never travels as a `CommsError`.

use crate::codec::AxisId;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type CommsResult<T> = std::result::Result<T, CommsError>;

/// Failure kinds surfaced by the communication stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommsError {
    /// I/O failure on the physical link.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No response within the configured window.
    #[error("Timed out after {0:?} waiting for the controller")]
    Timeout(Duration),

    /// Malformed or unterminated response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation attempted without an open link.
    #[error("Session not connected")]
    NotConnected,

    /// Move refused because the axis is still in motion.
    #[error("Axis {0} is still moving")]
    AxisBusy(AxisId),
}

impl CommsError {
    /// Whether the session should try to re-establish the link after this failure.
    pub(crate) fn triggers_reconnect(&self) -> bool {
        matches!(
            self,
            CommsError::Transport(_) | CommsError::Timeout(_) | CommsError::Protocol(_)
        )
    }

    /// Map an I/O error raised while waiting up to `timeout`.
    pub(crate) fn from_io(err: &std::io::Error, timeout: Duration) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                CommsError::Timeout(timeout)
            }
            std::io::ErrorKind::InvalidData => CommsError::Protocol(err.to_string()),
            _ => CommsError::Transport(err.to_string()),
        }
    }
}

/// An axis id outside the range the command grammar can express.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid axis id {0}: axes are numbered from 1")]
pub struct InvalidAxisId(pub u8);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = CommsError::Transport("port vanished".to_string());
        assert_eq!(err.to_string(), "Transport error: port vanished");
        assert_eq!(CommsError::NotConnected.to_string(), "Session not connected");
    }

    #[test]
    fn test_timeout_display_carries_duration() {
        let err = CommsError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_reconnect_trigger_kinds() {
        assert!(CommsError::Transport("x".into()).triggers_reconnect());
        assert!(CommsError::Timeout(Duration::from_secs(1)).triggers_reconnect());
        assert!(CommsError::Protocol("x".into()).triggers_reconnect());
        assert!(!CommsError::NotConnected.triggers_reconnect());
    }

    #[test]
    fn test_io_error_mapping() {
        let timeout = Duration::from_millis(250);
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "no data");
        assert_eq!(
            CommsError::from_io(&timed_out, timeout),
            CommsError::Timeout(timeout)
        );

        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "unplugged");
        assert!(matches!(
            CommsError::from_io(&broken, timeout),
            CommsError::Transport(_)
        ));
    }

    #[test]
    fn test_invalid_axis_display() {
        assert_eq!(
            InvalidAxisId(0).to_string(),
            "Invalid axis id 0: axes are numbered from 1"
        );
    }
}
