//! Signaling connection manager
//!
//! Owns the single SIP-over-WebSocket transport of an agent session: opens
//! it, registers, broadcasts connection status and reconnects with a linear
//! bounded backoff when the transport drops or registration fails.

pub mod digest;
pub mod sip;
pub mod transport;
pub mod ua;
pub mod websocket;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::auth::AuthState;
use crate::error::ConnectionError;
use crate::events::Broadcaster;

pub use transport::{SignalEvent, SignalingTransport};

pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: RECONNECT_BASE_DELAY,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Registered => "registered",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

struct Inner {
    transport: Option<Arc<dyn SignalingTransport>>,
    state: ConnectionState,
    attempts: u32,
    timer: Option<JoinHandle<()>>,
    /// Bumped by cleanup so connects that were in flight do not resurrect state.
    epoch: u64,
}

pub struct ConnectionManager {
    inner: Mutex<Inner>,
    status: Broadcaster<ConnectionState>,
    auth: Arc<dyn AuthState>,
    policy: ReconnectPolicy,
}

impl ConnectionManager {
    pub fn new(auth: Arc<dyn AuthState>) -> Arc<Self> {
        Self::with_policy(auth, ReconnectPolicy::default())
    }

    pub fn with_policy(auth: Arc<dyn AuthState>, policy: ReconnectPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                transport: None,
                state: ConnectionState::Disconnected,
                attempts: 0,
                timer: None,
                epoch: 0,
            }),
            status: Broadcaster::new(),
            auth,
            policy,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> &Broadcaster<ConnectionState> {
        &self.status
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_registered(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    /// Reconnection attempts made since the last successful registration.
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    pub fn transport(&self) -> Option<Arc<dyn SignalingTransport>> {
        self.lock().transport.clone()
    }

    /// Install the transport. Returns false, leaving the existing one in
    /// place, if the manager is already initialized.
    pub fn initialize(&self, transport: Arc<dyn SignalingTransport>) -> bool {
        let mut inner = self.lock();
        if inner.transport.is_some() {
            tracing::debug!("Signaling already initialized");
            return false;
        }
        inner.transport = Some(transport);
        true
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut inner = self.lock();
            let changed = inner.state != state;
            inner.state = state;
            changed
        };
        if changed {
            tracing::info!("Signaling {}", state);
            self.status.emit(&state);
        }
    }

    /// Open the transport and register.
    ///
    /// On failure a reconnection is scheduled before the error is returned.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let (transport, epoch) = {
            let inner = self.lock();
            let transport = inner.transport.clone().ok_or(ConnectionError::NotInitialized)?;
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Registered
            ) {
                tracing::debug!("connect() ignored while {}", inner.state);
                return Ok(());
            }
            (transport, inner.epoch)
        };

        self.set_state(ConnectionState::Connecting);

        if let Err(e) = transport.open().await {
            if self.is_current(epoch) {
                tracing::warn!("Signaling transport failed to open: {}", e);
                self.fail(ConnectionState::Disconnected);
            }
            return Err(e);
        }
        if !self.is_current(epoch) {
            transport.close().await;
            return Err(ConnectionError::Closed);
        }
        self.set_state(ConnectionState::Connected);

        if let Err(e) = transport.register().await {
            if self.is_current(epoch) {
                tracing::warn!("Registration failed: {}", e);
                self.fail(ConnectionState::Error);
            }
            return Err(e);
        }
        if !self.is_current(epoch) {
            return Err(ConnectionError::Closed);
        }

        self.lock().attempts = 0;
        self.set_state(ConnectionState::Registered);
        Ok(())
    }

    fn is_current(&self, epoch: u64) -> bool {
        let inner = self.lock();
        inner.epoch == epoch && inner.transport.is_some()
    }

    fn fail(self: &Arc<Self>, state: ConnectionState) {
        self.set_state(state);
        self.schedule_reconnect();
    }

    /// The WebSocket dropped underneath us.
    pub fn on_transport_lost(self: &Arc<Self>, reason: &str) {
        if self.lock().transport.is_none() {
            return;
        }
        tracing::warn!("Signaling transport lost: {}", reason);
        self.fail(ConnectionState::Disconnected);
    }

    /// A registration refresh was refused.
    pub fn on_registration_lost(self: &Arc<Self>, reason: &str) {
        if self.lock().transport.is_none() {
            return;
        }
        tracing::warn!("Registration lost: {}", reason);
        self.fail(ConnectionState::Error);
    }

    /// Arm the reconnection timer unless one is pending, the session is
    /// unauthenticated or the attempt budget is spent.
    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.auth.is_authenticated() {
            tracing::info!("Session not authenticated; reconnection skipped");
            return;
        }

        let exhausted = {
            let mut inner = self.lock();
            if inner.transport.is_none() {
                return;
            }
            if inner.timer.as_ref().is_some_and(|t| !t.is_finished()) {
                tracing::debug!("Reconnection already scheduled");
                return;
            }
            if inner.attempts >= self.policy.max_attempts {
                true
            } else {
                inner.attempts += 1;
                let attempt = inner.attempts;
                let delay = self.policy.delay_for(attempt);
                tracing::info!(
                    "Reconnecting in {}s (attempt {}/{})",
                    delay.as_secs(),
                    attempt,
                    self.policy.max_attempts
                );

                let manager = Arc::downgrade(self);
                inner.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    manager.lock().timer = None;
                    if let Err(e) = manager.connect().await {
                        tracing::debug!("Reconnection attempt {} failed: {}", attempt, e);
                    }
                }));
                false
            }
        };

        if exhausted {
            tracing::error!(
                "Giving up after {} reconnection attempts",
                self.policy.max_attempts
            );
            self.set_state(ConnectionState::Error);
        }
    }

    /// Manual recovery: cancel any pending timer, reset the attempt counter
    /// and connect immediately.
    pub async fn reconnect_now(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let transport = {
            let mut inner = self.lock();
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.attempts = 0;
            inner.transport.clone().ok_or(ConnectionError::NotInitialized)?
        };
        if self.state() != ConnectionState::Disconnected && self.state() != ConnectionState::Error {
            transport.close().await;
            self.set_state(ConnectionState::Disconnected);
        }
        self.connect().await
    }

    /// Tear down: cancel the timer, unregister, close the transport, drop
    /// listeners and return to the uninitialized state. Safe to call when
    /// never connected.
    pub async fn cleanup(&self) {
        let (transport, was_registered) = {
            let mut inner = self.lock();
            inner.epoch += 1;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.attempts = 0;
            (inner.transport.take(), inner.state == ConnectionState::Registered)
        };

        if let Some(transport) = transport {
            if was_registered {
                if let Err(e) = transport.unregister().await {
                    tracing::warn!("Unregister failed: {}", e);
                }
            }
            transport.close().await;
        }

        self.set_state(ConnectionState::Disconnected);
        self.status.clear();
    }
}
