//! Background position monitoring
//!
//! [`MotionPoller`] runs one task per session that, on a fixed interval,
//! asks each tracked axis whether it is moving and, once it has stopped,
//! reads its position and hands it to a [`PositionObserver`]. A position is
//! only published when it differs from the last one published for that axis.
//!
//! Axes are polled one after another through the shared session, so there
//! is never more than one outstanding query per axis, and ticks missed while
//! a slow query was in flight are not made up in a burst.
//!
//! [`MotionPoller::stop`] is a synchronization point: once it returns, the
//! task has exited and no further callbacks or wire queries happen.
//! Cancellation is checked before every query, never in the middle of one.

use crate::codec::AxisId;
use crate::error::CommsError;
use crate::instrument::esp300::AxisController;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Receives position updates from a [`MotionPoller`].
///
/// Called on the poller task; implementations should return quickly.
pub trait PositionObserver: Send + Sync + 'static {
    /// `axis` has stopped at `position` (controller formatting preserved).
    fn on_position_update(&self, axis: AxisId, position: &str);
}

impl<F> PositionObserver for F
where
    F: Fn(AxisId, &str) + Send + Sync + 'static,
{
    fn on_position_update(&self, axis: AxisId, position: &str) {
        self(axis, position)
    }
}

/// Handle to a running position-polling task
pub struct MotionPoller {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MotionPoller {
    /// Polling interval used when none is configured
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    /// Start polling `axes` every `interval`, publishing to `observer`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<O: PositionObserver>(
        controller: AxisController,
        axes: Vec<AxisId>,
        interval: Duration,
        observer: O,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let observer: Arc<dyn PositionObserver> = Arc::new(observer);

        info!(
            "Starting motion poller on '{}' for {} axes every {:?}",
            controller.session().name(),
            axes.len(),
            interval
        );

        let task_handle = tokio::spawn(poll_loop(
            controller,
            axes,
            interval,
            observer,
            shutdown_rx,
        ));

        Self {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Whether the polling task is still alive
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop polling and wait for the task to exit.
    ///
    /// A query already on the wire is allowed to complete first.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!("Motion poller task ended abnormally: {}", e);
            }
        }
        info!("Motion poller stopped");
    }
}

impl Drop for MotionPoller {
    fn drop(&mut self) {
        // Dropping without stop() still ends the task at its next check.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn shutdown_requested(shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty))
}

async fn poll_loop(
    controller: AxisController,
    axes: Vec<AxisId>,
    interval: Duration,
    observer: Arc<dyn PositionObserver>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_published: HashMap<AxisId, String> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {}
        }

        for &axis in &axes {
            if shutdown_requested(&mut shutdown_rx) {
                return;
            }

            let moving = match controller.get_motion_state(axis).await {
                Ok(moving) => moving,
                Err(e) => {
                    report(axis, &e);
                    continue;
                }
            };
            if moving {
                continue;
            }

            if shutdown_requested(&mut shutdown_rx) {
                return;
            }

            let position = match controller.get_position(axis).await {
                Ok(position) => position,
                Err(e) => {
                    report(axis, &e);
                    continue;
                }
            };

            if last_published.get(&axis) != Some(&position) {
                debug!("Axis {} settled at {}", axis, position);
                observer.on_position_update(axis, &position);
                last_published.insert(axis, position);
            }
        }
    }
}

fn report(axis: AxisId, error: &CommsError) {
    match error {
        // Already reported when the link dropped; don't repeat every tick.
        CommsError::NotConnected => debug!("Axis {} not polled: {}", axis, error),
        _ => warn!("Polling axis {} failed: {}", axis, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use crate::session::DeviceSession;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn controller(mock: &MockTransport) -> AxisController {
        let session = DeviceSession::builder(Box::new(mock.clone()))
            .reconnect_backoff(Duration::from_millis(1))
            .connect()
            .await
            .unwrap();
        AxisController::new(session)
    }

    #[tokio::test]
    async fn test_publishes_once_per_distinct_position() {
        let mock = MockTransport::new();
        mock.respond_to("1MD?", "1");
        mock.respond_to("1TP?", "10.0000");
        let controller = controller(&mock).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let poller = MotionPoller::spawn(
            controller,
            vec![AxisId::try_from(1).unwrap()],
            Duration::from_millis(5),
            move |_axis: AxisId, _position: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        poller.stop().await;

        // Many ticks, one unchanged position
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(mock.write_count() > 2);
    }

    #[tokio::test]
    async fn test_moving_axis_is_not_published() {
        let mock = MockTransport::new();
        mock.respond_to("1MD?", "0");
        let controller = controller(&mock).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let poller = MotionPoller::spawn(
            controller,
            vec![AxisId::try_from(1).unwrap()],
            Duration::from_millis(5),
            move |_axis: AxisId, _position: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        poller.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(mock.writes().iter().all(|w| w == "1MD?"));
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let mock = MockTransport::new();
        mock.respond_to("1MD?", "1");
        mock.respond_to("1TP?", "0.0000");
        let controller = controller(&mock).await;

        let poller = MotionPoller::spawn(
            controller,
            vec![AxisId::try_from(1).unwrap()],
            Duration::from_millis(5),
            |_axis: AxisId, _position: &str| {},
        );
        assert!(poller.is_running());
        poller.stop().await;

        let after_stop = mock.write_count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mock.write_count(), after_stop);
    }
}
