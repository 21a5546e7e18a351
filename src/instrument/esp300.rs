//! Newport ESP300 multi-axis motion controller
//!
//! [`AxisController`] is the public operation surface of the driver: every
//! method maps to one or two commands of the ESP300 ASCII grammar and goes
//! through a shared [`DeviceSession`], so calls from different tasks never
//! share wire time.
//!
//! ## Moves
//!
//! `move_to` and `move_relative` send the move, then `WS` (wait for stop).
//! The controller firmware holds every following command until the axis
//! settles, so the next command on the session is what actually waits for
//! motion to finish. If the move command fails, `WS` is not sent.
//!
//! ## Values
//!
//! Positions, velocities and accelerations are passed through as the
//! controller formats them (e.g. `"10.0000"`); no precision is imposed here.
//!
//! ## Example
//!
//! ```no_run
//! use esp300_control::adapters::TransportKind;
//! use esp300_control::codec::AxisId;
//! use esp300_control::instrument::esp300::AxisController;
//! use esp300_control::session::DeviceSession;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session =
//!     DeviceSession::connect(TransportKind::Serial, "/dev/ttyUSB0", Duration::from_secs(5)).await?;
//! let controller = AxisController::new(session);
//! let axis = AxisId::try_from(1)?;
//!
//! controller.move_to(axis, "10").await?;
//! println!("Axis 1 at {}", controller.get_position(axis).await?);
//! # Ok(())
//! # }
//! ```

use crate::codec::{AxisId, Command, Verb};
use crate::error::{CommsError, CommsResult};
use crate::session::DeviceSession;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// What to do when a move is requested on an axis that is still moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovePolicy {
    /// Send the move regardless; the controller queues it behind any `WS`.
    #[default]
    Unchecked,
    /// Query `MD?` first and fail with `CommsError::AxisBusy` if the axis is moving.
    ///
    /// The check and the move are separate commands, so another caller may
    /// still start a move in between.
    RefuseWhileMoving,
}

/// Snapshot of one axis, produced on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisStatus {
    /// Axis the snapshot is for
    pub axis: AxisId,
    /// Whether the controller reports the axis as moving
    pub moving: bool,
    /// Position as reported by the controller; only read once the axis is stopped
    pub position: Option<String>,
}

/// Operation surface for an ESP300 controller
#[derive(Debug, Clone)]
pub struct AxisController {
    session: DeviceSession,
    move_policy: MovePolicy,
}

impl AxisController {
    /// Drive the controller behind `session`
    pub fn new(session: DeviceSession) -> Self {
        Self {
            session,
            move_policy: MovePolicy::default(),
        }
    }

    /// Set the policy applied to `move_to` and `move_relative`
    pub fn with_move_policy(mut self, policy: MovePolicy) -> Self {
        self.move_policy = policy;
        self
    }

    /// Active move policy
    pub fn move_policy(&self) -> MovePolicy {
        self.move_policy
    }

    /// The session commands go through
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    async fn query(&self, command: Command) -> CommsResult<String> {
        self.session.query(&command.to_string()).await
    }

    async fn send(&self, command: Command) -> CommsResult<()> {
        self.session.write(&command.to_string()).await
    }

    async fn check_move_policy(&self, axis: AxisId) -> CommsResult<()> {
        if self.move_policy == MovePolicy::RefuseWhileMoving && self.get_motion_state(axis).await? {
            warn!("Refusing move on axis {}: still moving", axis);
            return Err(CommsError::AxisBusy(axis));
        }
        Ok(())
    }

    async fn move_and_wait(&self, axis: AxisId, move_command: Command) -> CommsResult<()> {
        self.check_move_policy(axis).await?;
        debug!("Axis {}: {}", axis, move_command);
        self.send(move_command).await?;
        self.send(Command::for_axis(axis, Verb::WaitForStop)).await
    }

    /// Move `axis` to an absolute `position`, then wait for it to stop
    pub async fn move_to(&self, axis: AxisId, position: impl fmt::Display) -> CommsResult<()> {
        let command = Command::for_axis(axis, Verb::MoveAbsolute).with_argument(position);
        self.move_and_wait(axis, command).await
    }

    /// Move `axis` by `delta`, then wait for it to stop
    pub async fn move_relative(&self, axis: AxisId, delta: impl fmt::Display) -> CommsResult<()> {
        let command = Command::for_axis(axis, Verb::MoveRelative).with_argument(delta);
        self.move_and_wait(axis, command).await
    }

    /// Current position of `axis`, verbatim
    pub async fn get_position(&self, axis: AxisId) -> CommsResult<String> {
        self.query(Command::for_axis(axis, Verb::TellPosition)).await
    }

    /// Whether `axis` is moving (`MD?` answers `1` once the axis has stopped)
    pub async fn get_motion_state(&self, axis: AxisId) -> CommsResult<bool> {
        let response = self.query(Command::for_axis(axis, Verb::MotionDone)).await?;
        match response.as_str() {
            "1" => Ok(false),
            "0" => Ok(true),
            other => Err(CommsError::Protocol(format!(
                "Unexpected motion-done reply for axis {}: '{}'",
                axis, other
            ))),
        }
    }

    /// Motion state of `axis`, plus its position when it has stopped
    pub async fn axis_status(&self, axis: AxisId) -> CommsResult<AxisStatus> {
        let moving = self.get_motion_state(axis).await?;
        let position = if moving {
            None
        } else {
            Some(self.get_position(axis).await?)
        };
        Ok(AxisStatus {
            axis,
            moving,
            position,
        })
    }

    /// Set the velocity of `axis`
    pub async fn set_velocity(&self, axis: AxisId, velocity: impl fmt::Display) -> CommsResult<()> {
        self.send(Command::for_axis(axis, Verb::SetVelocity).with_argument(velocity))
            .await
    }

    /// Velocity of `axis`, verbatim
    pub async fn get_velocity(&self, axis: AxisId) -> CommsResult<String> {
        self.query(Command::for_axis(axis, Verb::QueryVelocity)).await
    }

    /// Set the acceleration of `axis`
    pub async fn set_acceleration(
        &self,
        axis: AxisId,
        acceleration: impl fmt::Display,
    ) -> CommsResult<()> {
        self.send(Command::for_axis(axis, Verb::SetAcceleration).with_argument(acceleration))
            .await
    }

    /// Acceleration of `axis`, verbatim
    pub async fn get_acceleration(&self, axis: AxisId) -> CommsResult<String> {
        self.query(Command::for_axis(axis, Verb::QueryAcceleration))
            .await
    }

    /// Set the deceleration of `axis`
    pub async fn set_deceleration(
        &self,
        axis: AxisId,
        deceleration: impl fmt::Display,
    ) -> CommsResult<()> {
        self.send(Command::for_axis(axis, Verb::SetDeceleration).with_argument(deceleration))
            .await
    }

    /// Deceleration of `axis`, verbatim
    pub async fn get_deceleration(&self, axis: AxisId) -> CommsResult<String> {
        self.query(Command::for_axis(axis, Verb::QueryDeceleration))
            .await
    }

    /// Define the current position of `axis` as zero
    pub async fn zero_position(&self, axis: AxisId) -> CommsResult<()> {
        self.send(Command::for_axis(axis, Verb::DefineHome).with_argument(0))
            .await
    }

    /// Power the motor of `axis`
    pub async fn enable_axis(&self, axis: AxisId) -> CommsResult<()> {
        self.send(Command::for_axis(axis, Verb::MotorOn)).await
    }

    /// Remove power from the motor of `axis`
    pub async fn disable_axis(&self, axis: AxisId) -> CommsResult<()> {
        self.send(Command::for_axis(axis, Verb::MotorOff)).await
    }

    /// Stop motion on `axis`
    pub async fn stop_axis(&self, axis: AxisId) -> CommsResult<()> {
        self.send(Command::for_axis(axis, Verb::Stop)).await
    }

    /// Controller identification string
    pub async fn identify(&self) -> CommsResult<String> {
        self.query(Command::global(Verb::Identify)).await
    }

    /// Send `command` exactly as given and return the response
    pub async fn execute_raw(&self, command: &str) -> CommsResult<String> {
        self.session.query(command).await
    }

    /// Send `command` exactly as given without waiting for a response
    pub async fn write_raw(&self, command: &str) -> CommsResult<()> {
        self.session.write(command).await
    }
}
