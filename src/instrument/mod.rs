//! ESP300 instrument layer
//!
//! Built on top of a [`DeviceSession`](crate::session::DeviceSession):
//! - [`AxisController`] for the per-axis command surface
//! - [`MotionPoller`] for background position monitoring

pub mod esp300;
pub mod motion_poller;

pub use esp300::{AxisController, AxisStatus, MovePolicy};
pub use motion_poller::{MotionPoller, PositionObserver};
