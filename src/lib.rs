//! Driver library for the Newport ESP300 motion controller.
//!
//! The driver talks the controller's axis-prefixed ASCII command grammar over
//! either an RS-232 line or a VISA instrument bus. It is layered bottom-up:
//!
//! - [`adapters`]: byte transports (`SerialTransport`, `BusTransport`, `MockTransport`)
//! - [`codec`]: command grammar and message framing
//! - [`session`]: the single owner of a link, with serialized access and reconnect
//! - [`instrument`]: the axis controller and the motion poller
//!
//! Front ends (the `esp300` binary, a GUI) hold a [`DeviceSession`] and pass it
//! to an [`AxisController`]; there is no process-wide device object.

pub mod adapters;
pub mod codec;
pub mod config;
pub mod error;
pub mod instrument;
pub mod session;

pub use adapters::{Transport, TransportKind};
pub use codec::{AxisId, Command, Verb};
pub use error::{CommsError, CommsResult};
pub use instrument::{AxisController, AxisStatus, MotionPoller, MovePolicy, PositionObserver};
pub use session::{ConnectionState, DeviceSession, DeviceSessionBuilder};
