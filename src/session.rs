//! Device session: the single owner of a controller link.
//!
//! A [`DeviceSession`] owns exactly one [`Transport`] and is the only path to
//! the wire. Every command, whether it comes from the axis controller, the
//! motion poller or a raw-command sender, goes through one async mutex, so at
//! most one request is ever in flight and concurrent callers queue in arrival
//! order.
//!
//! ## Connection state
//!
//! ```text
//! Connected --(I/O failure)--> Reconnecting --(reopen ok)----> Connected
//!                              Reconnecting --(reopen fails)--> Disconnected
//! ```
//!
//! A failed command triggers exactly one reconnect attempt and the original
//! error is still returned; nothing is retried. `Disconnected` is terminal
//! until a caller asks for [`DeviceSession::reconnect`] or connects afresh.
//!
//! Handles are cheap to clone and all refer to the same link.

use crate::adapters::{build_transport, Transport, TransportKind};
use crate::codec::Framing;
use crate::config::ConnectionConfig;
use crate::error::{CommsError, CommsResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Capacity of the state-transition broadcast channel.
const STATE_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle of a session's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No open link. Commands fail with `CommsError::NotConnected`.
    Disconnected,
    /// Link open and usable.
    Connected,
    /// A failure was seen; the link is being closed and reopened.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::Reconnecting => f.write_str("Reconnecting"),
        }
    }
}

struct SessionInner {
    transport: Box<dyn Transport>,
    framing: Framing,
    timeout: Duration,
    backoff: Duration,
}

impl SessionInner {
    async fn send(&mut self, command: &str) -> CommsResult<()> {
        let bytes = self.framing.encode(command);
        debug!("-> {}", command.trim_end());
        self.transport.write(&bytes).await
    }

    async fn receive(&mut self) -> CommsResult<String> {
        let terminator = self.framing.read_terminator();
        let raw = self.transport.read_until(terminator.as_bytes()).await?;
        let response = self.framing.decode(&raw)?;
        debug!("<- {}", response);
        Ok(response)
    }

    async fn exchange(&mut self, command: &str) -> CommsResult<String> {
        self.send(command).await?;
        self.receive().await
    }

    async fn reopen(&mut self) -> CommsResult<()> {
        self.transport.open().await?;
        self.transport.set_timeout(self.timeout).await
    }
}

/// Shared handle to one controller link.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Mutex<SessionInner>>,
    state: Arc<watch::Sender<ConnectionState>>,
    transitions: broadcast::Sender<ConnectionState>,
    kind: TransportKind,
    name: Arc<str>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceSession {
    /// Open a link of `kind` at `address` and return a connected session.
    ///
    /// The transport kind is resolved here, once; nothing downstream looks at
    /// it again.
    pub async fn connect(
        kind: TransportKind,
        address: &str,
        timeout: Duration,
    ) -> CommsResult<Self> {
        let transport = build_transport(kind, address, timeout, false)?;
        DeviceSessionBuilder::new(transport)
            .timeout(timeout)
            .connect()
            .await
    }

    /// Open a link described by a `[connection]` configuration section.
    pub async fn connect_with(config: &ConnectionConfig) -> CommsResult<Self> {
        let transport = config.build_transport()?;
        let mut builder = DeviceSessionBuilder::new(transport)
            .timeout(config.timeout())
            .verify_identity(config.verify_identity);
        if let Some(backoff) = config.reconnect_backoff() {
            builder = builder.reconnect_backoff(backoff);
        }
        builder.connect().await
    }

    /// Start building a session around an unopened transport.
    pub fn builder(transport: Box<dyn Transport>) -> DeviceSessionBuilder {
        DeviceSessionBuilder::new(transport)
    }

    /// Which link this session drives.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Address of the link (port path or resource string).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether commands can currently be issued.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receive every state transition from now on.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Receiver that always holds the latest state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Session '{}': {} -> {}", self.name, previous, next);
            // No subscribers is fine.
            let _ = self.transitions.send(next);
        }
    }

    async fn lock_connected(&self) -> CommsResult<MutexGuard<'_, SessionInner>> {
        let inner = self.inner.lock().await;
        // Checked under the lock: a queued caller may find the link gone.
        if self.state() != ConnectionState::Connected {
            return Err(CommsError::NotConnected);
        }
        Ok(inner)
    }

    /// Send `command` and wait for its one-line response.
    ///
    /// On a transport, timeout or protocol failure the session attempts one
    /// reconnect before returning the original error. The command is not
    /// re-sent.
    pub async fn query(&self, command: &str) -> CommsResult<String> {
        let mut inner = self.lock_connected().await?;
        let result = inner.exchange(command).await;
        self.settle(&mut inner, command, result).await
    }

    /// Send `command` without waiting for a response.
    ///
    /// Failure handling is the same as [`DeviceSession::query`].
    pub async fn write(&self, command: &str) -> CommsResult<()> {
        let mut inner = self.lock_connected().await?;
        let result = inner.send(command).await;
        self.settle(&mut inner, command, result).await
    }

    /// Like [`DeviceSession::query`], but waits up to `timeout` for this call only.
    pub async fn query_with_timeout(&self, command: &str, timeout: Duration) -> CommsResult<String> {
        let mut inner = self.lock_connected().await?;
        let session_timeout = inner.timeout;

        let result = match inner.transport.set_timeout(timeout).await {
            Ok(()) => inner.exchange(command).await,
            Err(e) => Err(e),
        };

        if let Err(e) = inner.transport.set_timeout(session_timeout).await {
            warn!("Failed to restore timeout on '{}': {}", self.name, e);
        }

        self.settle(&mut inner, command, result).await
    }

    async fn settle<T>(
        &self,
        inner: &mut SessionInner,
        command: &str,
        result: CommsResult<T>,
    ) -> CommsResult<T> {
        if let Err(e) = &result {
            if e.triggers_reconnect() {
                warn!(
                    "Command '{}' on '{}' failed: {}",
                    command.trim_end(),
                    self.name,
                    e
                );
                if let Err(reconnect_err) = self.reconnect_locked(inner).await {
                    error!("{}", reconnect_err);
                }
            }
        }
        result
    }

    async fn reconnect_locked(&self, inner: &mut SessionInner) -> CommsResult<()> {
        self.set_state(ConnectionState::Reconnecting);

        if let Err(e) = inner.transport.close().await {
            warn!("Error closing '{}' before reconnect: {}", self.name, e);
        }

        tokio::time::sleep(inner.backoff).await;

        match inner.reopen().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("Reconnected to '{}'", self.name);
                Ok(())
            }
            Err(e) => {
                // Don't leave a half-open link behind.
                let _ = inner.transport.close().await;
                self.set_state(ConnectionState::Disconnected);
                Err(CommsError::Transport(format!(
                    "reconnect to '{}' failed: {}",
                    self.name, e
                )))
            }
        }
    }

    /// Close the link, wait the backoff interval, reopen it and restore the timeout.
    ///
    /// Works from any state, including `Disconnected`. A failure is reported
    /// and leaves the session `Disconnected`; it is not retried.
    pub async fn reconnect(&self) -> CommsResult<()> {
        let mut inner = self.inner.lock().await;
        self.reconnect_locked(&mut inner).await
    }

    /// Close the link. Later commands fail with `CommsError::NotConnected`.
    pub async fn disconnect(&self) -> CommsResult<()> {
        let mut inner = self.inner.lock().await;
        let result = inner.transport.close().await;
        if self.state() != ConnectionState::Disconnected {
            info!("Disconnected from '{}'", self.name);
        }
        self.set_state(ConnectionState::Disconnected);
        result
    }

    /// Change the session timeout, applied to the link immediately.
    pub async fn set_timeout(&self, timeout: Duration) -> CommsResult<()> {
        let mut inner = self.inner.lock().await;
        inner.timeout = timeout;
        if inner.transport.is_open() {
            inner.transport.set_timeout(timeout).await?;
        }
        Ok(())
    }

    /// The session timeout.
    pub async fn timeout(&self) -> Duration {
        self.inner.lock().await.timeout
    }
}

/// Builder for [`DeviceSession`].
///
/// # Example
///
/// ```no_run
/// use esp300_control::adapters::SerialTransport;
/// use esp300_control::session::DeviceSession;
/// use std::time::Duration;
///
/// # async fn example() -> esp300_control::error::CommsResult<()> {
/// let transport = SerialTransport::new("/dev/ttyUSB0".to_string(), 19200)
///     .with_flow_control(true);
/// let session = DeviceSession::builder(Box::new(transport))
///     .timeout(Duration::from_secs(5))
///     .verify_identity(true)
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct DeviceSessionBuilder {
    transport: Box<dyn Transport>,
    timeout: Option<Duration>,
    backoff: Option<Duration>,
    verify_identity: bool,
}

impl DeviceSessionBuilder {
    /// Wrap an unopened transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: None,
            backoff: None,
            verify_identity: false,
        }
    }

    /// Session timeout (defaults to the transport's own).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pause between close and reopen during a reconnect.
    ///
    /// Defaults to 2s for serial links and 5s for bus links.
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Query `*IDN?` after opening and fail the connect if it gets no answer.
    pub fn verify_identity(mut self, verify: bool) -> Self {
        self.verify_identity = verify;
        self
    }

    /// Open the link and return a connected session.
    pub async fn connect(self) -> CommsResult<DeviceSession> {
        let kind = self.transport.kind();
        let name: Arc<str> = Arc::from(self.transport.name());
        let timeout = self.timeout.unwrap_or_else(|| self.transport.timeout());
        let backoff = self.backoff.unwrap_or_else(|| kind.reconnect_backoff());

        let mut inner = SessionInner {
            framing: self.transport.framing(),
            transport: self.transport,
            timeout,
            backoff,
        };

        inner.reopen().await.map_err(|e| {
            warn!("Failed to connect to '{}': {}", name, e);
            e
        })?;

        if self.verify_identity {
            match inner.exchange("*IDN?").await {
                Ok(identity) if !identity.is_empty() => {
                    info!("'{}' identifies as {}", name, identity);
                }
                Ok(_) => {
                    let _ = inner.transport.close().await;
                    return Err(CommsError::Protocol(format!(
                        "'{}' returned an empty identity",
                        name
                    )));
                }
                Err(e) => {
                    let _ = inner.transport.close().await;
                    return Err(e);
                }
            }
        }

        info!(
            "Connected to '{}' over {} (timeout {:?})",
            name, kind, timeout
        );

        let (state, _) = watch::channel(ConnectionState::Connected);
        let (transitions, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);

        Ok(DeviceSession {
            inner: Arc::new(Mutex::new(inner)),
            state: Arc::new(state),
            transitions,
            kind,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    async fn connected(mock: &MockTransport) -> DeviceSession {
        DeviceSession::builder(Box::new(mock.clone()))
            .timeout(Duration::from_secs(5))
            .reconnect_backoff(Duration::from_millis(1))
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_applies_timeout() {
        let mock = MockTransport::new();
        let session = connected(&mock).await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(mock.timeout(), Duration::from_secs(5));
        assert_eq!(session.timeout().await, Duration::from_secs(5));
        assert_eq!(session.kind(), TransportKind::Serial);
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let mock = MockTransport::new();
        mock.set_offline(true);
        let result = DeviceSession::builder(Box::new(mock)).connect().await;
        assert!(matches!(result, Err(CommsError::Transport(_))));
    }

    #[tokio::test]
    async fn test_query_decodes_response() {
        let mock = MockTransport::new();
        mock.respond_to("2VA?", "  20.0000 ");
        let session = connected(&mock).await;

        assert_eq!(session.query("2VA?").await.unwrap(), "20.0000");
        assert_eq!(mock.writes(), vec!["2VA?"]);
    }

    #[tokio::test]
    async fn test_write_does_not_read() {
        let mock = MockTransport::new();
        let session = connected(&mock).await;

        session.write("1ST").await.unwrap();
        assert!(mock.call_log().iter().all(|entry| !entry.starts_with("read:")));
    }

    #[tokio::test]
    async fn test_empty_response_is_valid() {
        let mock = MockTransport::new();
        mock.respond_to("1MO", "");
        let session = connected(&mock).await;
        assert_eq!(session.query("1MO").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_timeout_reconnects_and_surfaces_error() {
        let mock = MockTransport::new();
        let session = connected(&mock).await;
        let mut transitions = session.subscribe_state();

        let result = session.query("1TP?").await;
        assert_eq!(result, Err(CommsError::Timeout(Duration::from_secs(5))));

        assert_eq!(transitions.recv().await.unwrap(), ConnectionState::Reconnecting);
        assert_eq!(transitions.recv().await.unwrap(), ConnectionState::Connected);
        assert_eq!(mock.open_count(), 2);
        // Not retried
        assert_eq!(mock.writes(), vec!["1TP?"]);
    }

    #[tokio::test]
    async fn test_not_connected_after_disconnect() {
        let mock = MockTransport::new();
        let session = connected(&mock).await;

        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.query("1TP?").await, Err(CommsError::NotConnected));
        assert_eq!(mock.write_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_reconnect_from_disconnected() {
        let mock = MockTransport::new();
        mock.respond_to("1TP?", "0.0000");
        let session = connected(&mock).await;
        session.disconnect().await.unwrap();

        session.reconnect().await.unwrap();
        assert!(session.is_connected());
        assert_eq!(session.query("1TP?").await.unwrap(), "0.0000");
    }

    #[tokio::test]
    async fn test_query_with_timeout_restores_session_timeout() {
        let mock = MockTransport::new();
        mock.respond_to("1WS", "");
        let session = connected(&mock).await;

        session
            .query_with_timeout("1WS", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(mock.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failed_query_with_timeout_restores_session_timeout() {
        let mock = MockTransport::new();
        let session = connected(&mock).await;
        session.set_timeout(Duration::from_millis(1500)).await.unwrap();

        // Reopen fails, so only the restore itself can put 1500ms back
        mock.fail_next_open();
        let result = session
            .query_with_timeout("1TP?", Duration::from_millis(200))
            .await;
        assert_eq!(result, Err(CommsError::Timeout(Duration::from_millis(200))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(mock.timeout(), Duration::from_millis(1500));
        assert_eq!(session.timeout().await, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_set_timeout_reaches_transport() {
        let mock = MockTransport::new();
        let session = connected(&mock).await;

        session.set_timeout(Duration::from_millis(1500)).await.unwrap();
        assert_eq!(mock.timeout(), Duration::from_millis(1500));
        assert_eq!(session.timeout().await, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_verify_identity() {
        let mock = MockTransport::new();
        mock.respond_to("*IDN?", "ESP300 Version 3.08 09/09/02");
        let session = DeviceSession::builder(Box::new(mock.clone()))
            .verify_identity(true)
            .connect()
            .await
            .unwrap();
        assert!(session.is_connected());

        let silent = MockTransport::new();
        let result = DeviceSession::builder(Box::new(silent.clone()))
            .verify_identity(true)
            .connect()
            .await;
        assert!(matches!(result, Err(CommsError::Timeout(_))));
        assert!(!silent.is_open());
    }
}
