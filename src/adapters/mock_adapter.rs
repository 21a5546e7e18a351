//! Mock transport for testing
//!
//! Simulates an ESP300 on the other end of the wire so sessions, axis
//! controllers and pollers can be exercised without hardware. It provides:
//! - Scripted replies keyed by command text
//! - Simulated latency
//! - Controllable failure injection (per operation, or the whole link)
//! - A call log for verifying exactly what went over the wire
//!
//! Clones share state, so a test can keep one handle for scripting and
//! inspection while the session owns another.

use super::{Transport, TransportKind};
use crate::codec::RESPONSE_TERMINATOR;
use crate::error::{CommsError, CommsResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Timeout a freshly opened mock link starts with, before anyone configures it.
pub const MOCK_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct MockState {
    open: bool,
    timeout: Duration,
    latency: Duration,
    replies: HashMap<String, String>,
    queued: HashMap<String, VecDeque<String>>,
    pending: VecDeque<Vec<u8>>,
    fail_next_open: bool,
    fail_next_write: bool,
    fail_next_read: bool,
    offline: bool,
    call_log: Vec<String>,
    writes: Vec<String>,
    open_count: usize,
    close_count: usize,
}

/// Scriptable in-memory transport
///
/// # Example
///
/// ```
/// use esp300_control::adapters::MockTransport;
///
/// let mock = MockTransport::new();
/// mock.respond_to("1TP?", "10.0000");
/// assert_eq!(mock.write_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct MockTransport {
    kind: TransportKind,
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock serial transport with no scripted replies
    pub fn new() -> Self {
        Self::with_kind(TransportKind::Serial)
    }

    /// Create a mock that reports the given link kind (and hence framing)
    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            name: format!("mock-{}", kind),
            state: Arc::new(Mutex::new(MockState {
                open: false,
                timeout: MOCK_OPEN_TIMEOUT,
                latency: Duration::ZERO,
                replies: HashMap::new(),
                queued: HashMap::new(),
                pending: VecDeque::new(),
                fail_next_open: false,
                fail_next_write: false,
                fail_next_read: false,
                offline: false,
                call_log: Vec::new(),
                writes: Vec::new(),
                open_count: 0,
                close_count: 0,
            })),
        }
    }

    /// Set simulated latency applied to every write and read
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always answer `command` with `reply`
    ///
    /// `command` is matched against the written text with its terminator removed.
    pub fn respond_to(&self, command: &str, reply: &str) {
        self.lock()
            .replies
            .insert(command.trim().to_string(), reply.to_string());
    }

    /// Answer the next `command` with `reply`, ahead of any standing reply
    pub fn queue_reply(&self, command: &str, reply: &str) {
        self.lock()
            .queued
            .entry(command.trim().to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Put raw bytes on the wire as if the controller had sent them unprompted
    pub fn push_raw(&self, bytes: &[u8]) {
        self.lock().pending.push_back(bytes.to_vec());
    }

    /// Fail the next `open` with a transport error
    pub fn fail_next_open(&self) {
        self.lock().fail_next_open = true;
    }

    /// Fail the next `write` with a transport error
    pub fn fail_next_write(&self) {
        self.lock().fail_next_write = true;
    }

    /// Fail the next `read_until` with a transport error
    pub fn fail_next_read(&self) {
        self.lock().fail_next_read = true;
    }

    /// Simulate the device being unplugged (or plugged back in)
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Every operation in order, e.g. `open`, `write:1PA10`, `read:10.0000`
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Clear the call log and the write record
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.call_log.clear();
        state.writes.clear();
    }

    /// Command text of every write, terminator removed
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Number of writes so far
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// Number of closes
    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn command_key(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn timeout(&self) -> Duration {
        self.lock().timeout
    }

    async fn open(&mut self) -> CommsResult<()> {
        let mut state = self.lock();
        state.call_log.push("open".to_string());

        if state.offline {
            return Err(CommsError::Transport(format!("{} is offline", self.name)));
        }
        if std::mem::take(&mut state.fail_next_open) {
            return Err(CommsError::Transport("Injected open failure".to_string()));
        }

        if !state.open {
            // A reopened port forgets whatever timeout it had.
            state.open = true;
            state.timeout = MOCK_OPEN_TIMEOUT;
            state.open_count += 1;
        }
        Ok(())
    }

    async fn close(&mut self) -> CommsResult<()> {
        let mut state = self.lock();
        state.call_log.push("close".to_string());
        if state.open {
            state.open = false;
            state.close_count += 1;
        }
        state.pending.clear();
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> CommsResult<()> {
        self.simulate_latency().await;

        let mut state = self.lock();
        let key = command_key(bytes);
        state.call_log.push(format!("write:{}", key));

        if state.offline {
            return Err(CommsError::Transport(format!("{} is offline", self.name)));
        }
        if !state.open {
            return Err(CommsError::Transport("Write on closed port".to_string()));
        }
        if std::mem::take(&mut state.fail_next_write) {
            return Err(CommsError::Transport("Injected write failure".to_string()));
        }

        state.writes.push(key.clone());

        let reply = match state.queued.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(reply) => Some(reply),
            None => state.replies.get(&key).cloned(),
        };
        if let Some(reply) = reply {
            let mut framed = reply.into_bytes();
            framed.extend_from_slice(RESPONSE_TERMINATOR.as_bytes());
            state.pending.push_back(framed);
        }
        Ok(())
    }

    async fn read_until(&mut self, terminator: &[u8]) -> CommsResult<Vec<u8>> {
        self.simulate_latency().await;

        let mut state = self.lock();

        if state.offline {
            state.call_log.push("read:<offline>".to_string());
            return Err(CommsError::Transport(format!("{} is offline", self.name)));
        }
        if !state.open {
            return Err(CommsError::Transport("Read on closed port".to_string()));
        }
        if std::mem::take(&mut state.fail_next_read) {
            state.call_log.push("read:<failed>".to_string());
            return Err(CommsError::Transport("Injected read failure".to_string()));
        }

        match state.pending.pop_front() {
            Some(bytes) => {
                state.call_log.push(format!("read:{}", command_key(&bytes)));
                if bytes.ends_with(terminator) {
                    Ok(bytes)
                } else {
                    Err(CommsError::Protocol(format!(
                        "Unterminated response: {:?}",
                        String::from_utf8_lossy(&bytes)
                    )))
                }
            }
            None => {
                state.call_log.push("read:<timeout>".to_string());
                Err(CommsError::Timeout(state.timeout))
            }
        }
    }

    async fn set_timeout(&mut self, timeout: Duration) -> CommsResult<()> {
        self.lock().timeout = timeout;
        Ok(())
    }
}
