//! Connection lifecycle and automatic reconnection
//!
//! [`ConnectionManager`] owns one transport and drives it through
//! `Connecting -> Connected -> Disconnected -> Reconnecting -> (Connected | Terminated)`.
//! Every drop is classified into a [`DisconnectReason`]; only reasons that are
//! auto-reconnectable start the backoff schedule. An explicit [`close`]
//! terminates the session and disables auto-reconnect for good.
//!
//! Observers subscribe to [`ConnectionEvent`]s through [`ConnectionManager::listeners`].
//!
//! [`close`]: ConnectionManager::close

use crate::transport::{Transport, TransportError};
use log::{info, warn};
use parking_lot::Mutex;
use rand::Rng;
use shared::error::classify;
use shared::recovery::{RecoveryContext, RecoveryFuture, RecoveryResult, RecoveryStrategy};
use shared::{ClassificationHint, ErrorKind, Listeners, RecoveryStrategyKind, TypedError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    UserClosed,
    NetworkError,
    ConnectionLost,
    HeartbeatTimeout,
    ProtocolError,
    /// The server ended the session, e.g. when shutting down or full
    ServerClosed(String),
    Fatal(String),
}

impl DisconnectReason {
    pub fn auto_reconnectable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::NetworkError
                | DisconnectReason::ConnectionLost
                | DisconnectReason::HeartbeatTimeout
        )
    }

    pub fn from_error(error: &TypedError) -> Self {
        match error.kind {
            ErrorKind::ConnectionLost => DisconnectReason::ConnectionLost,
            ErrorKind::ConnectionTimeout | ErrorKind::ConnectionRefused | ErrorKind::Timeout => {
                DisconnectReason::NetworkError
            }
            ErrorKind::ProtocolMalformed
            | ErrorKind::ProtocolOutOfOrder
            | ErrorKind::ProtocolVersionMismatch => DisconnectReason::ProtocolError,
            _ => DisconnectReason::Fatal(error.message.clone()),
        }
    }

    /// The typed fault this reason is reported as
    pub fn to_error(&self) -> TypedError {
        match self {
            DisconnectReason::NetworkError => {
                TypedError::new(ErrorKind::ConnectionRefused, self.to_string())
            }
            DisconnectReason::ConnectionLost | DisconnectReason::HeartbeatTimeout => {
                TypedError::new(ErrorKind::ConnectionLost, self.to_string())
            }
            DisconnectReason::ProtocolError => {
                TypedError::new(ErrorKind::ProtocolMalformed, self.to_string()).unrecoverable()
            }
            DisconnectReason::UserClosed
            | DisconnectReason::ServerClosed(_)
            | DisconnectReason::Fatal(_) => {
                TypedError::new(ErrorKind::Application, self.to_string()).unrecoverable()
            }
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UserClosed => write!(f, "closed by user"),
            DisconnectReason::NetworkError => write!(f, "network error"),
            DisconnectReason::ConnectionLost => write!(f, "connection lost"),
            DisconnectReason::HeartbeatTimeout => write!(f, "heartbeat timed out"),
            DisconnectReason::ProtocolError => write!(f, "protocol error"),
            DisconnectReason::ServerClosed(reason) => write!(f, "server closed: {}", reason),
            DisconnectReason::Fatal(reason) => write!(f, "fatal: {}", reason),
        }
    }
}

/// Maps a transport failure to the reason recorded for the drop.
pub fn classify_disconnect(error: &TransportError, hint: Option<ClassificationHint>) -> DisconnectReason {
    match error {
        TransportError::NotConnected => DisconnectReason::ConnectionLost,
        TransportError::Io(io_error) => DisconnectReason::from_error(&classify(io_error, hint)),
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt. Default: 1 s.
    pub initial_delay: Duration,
    /// Default: 2.0.
    pub backoff_multiplier: f64,
    /// Default: 16 s.
    pub max_delay: Duration,
    /// Default: 5.
    pub max_attempts: u32,
    /// Fraction of each delay applied as random +/- jitter. Default: 0.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(16),
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt`, counting from 1, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Sum of every delay in the schedule.
    pub fn worst_case_wait(&self) -> Duration {
        (1..=self.max_attempts).map(|attempt| self.delay_for(attempt)).sum()
    }
}

/// Attempt counter for one reconnection schedule
pub struct Backoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Advances to the next attempt and returns its delay, or None once the
    /// attempt ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let base = self.config.delay_for(self.attempts);
        if self.config.jitter > 0.0 {
            let jitter = self.config.jitter.min(1.0);
            let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
            Some(base.mul_f64(factor).min(self.config.max_delay))
        } else {
            Some(base)
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn remaining(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Default: 30 s.
    pub interval: Duration,
    /// Silence after which the connection counts as lost. Default: 60 s.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    /// Default: true.
    pub auto_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    ReconnectScheduled {
        attempt: u32,
        remaining: u32,
        delay: Duration,
    },
    ReconnectFailed {
        attempt: u32,
        error: String,
    },
    /// Transport is back; the session state must be re-fetched
    Resynchronizing,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is not established")]
    NotConnected,
    #[error("connection has been terminated")]
    Terminated,
    #[error("gave up after {0} reconnection attempts")]
    AttemptsExhausted(u32),
    #[error("connection dropped: {0}")]
    Lost(DisconnectReason),
    #[error("could not connect: {reason}")]
    ConnectFailed {
        reason: DisconnectReason,
        #[source]
        source: TransportError,
    },
}

pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    auto_reconnect: AtomicBool,
    backoff: Mutex<Backoff>,
    last_heard: Mutex<Instant>,
    listeners: Listeners<ConnectionEvent>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            auto_reconnect: AtomicBool::new(config.auto_reconnect),
            backoff: Mutex::new(Backoff::new(config.reconnect.clone())),
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            last_heard: Mutex::new(Instant::now()),
            listeners: Listeners::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn listeners(&self) -> &Listeners<ConnectionEvent> {
        &self.listeners
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Moves to `to` and notifies observers. Terminated is final.
    fn transition(&self, to: ConnectionState) -> bool {
        let from = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Terminated || *state == to {
                return false;
            }
            std::mem::replace(&mut *state, to)
        };
        info!("Connection {:?} -> {:?}", from, to);
        self.listeners
            .notify(&ConnectionEvent::StateChanged { from, to });
        true
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Terminated {
            return Err(ConnectionError::Terminated);
        }
        self.transition(ConnectionState::Connecting);

        match self.transport.connect().await {
            Ok(()) => {
                self.backoff.lock().reset();
                self.record_heartbeat();
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(source) => {
                let reason = classify_disconnect(&source, Some(ClassificationHint::ConnectionAttempt));
                self.mark_disconnected(reason.clone());
                Err(ConnectionError::ConnectFailed { reason, source })
            }
        }
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        match self.transport.send(bytes).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.lost(&e)),
        }
    }

    pub async fn receive(&self) -> Result<Vec<u8>, ConnectionError> {
        self.ensure_connected()?;
        match self.transport.receive().await {
            Ok(bytes) => {
                self.record_heartbeat();
                Ok(bytes)
            }
            Err(e) => Err(self.lost(&e)),
        }
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Terminated => Err(ConnectionError::Terminated),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    fn lost(&self, error: &TransportError) -> ConnectionError {
        let reason = classify_disconnect(error, None);
        warn!("Transport failure: {} ({})", error, reason);
        self.mark_disconnected(reason.clone());
        ConnectionError::Lost(reason)
    }

    /// Records a drop. Returns true if the reason and settings call for an
    /// automatic reconnect.
    pub fn mark_disconnected(&self, reason: DisconnectReason) -> bool {
        if self.state() == ConnectionState::Terminated {
            return false;
        }
        self.transition(ConnectionState::Disconnected);
        self.listeners.notify(&ConnectionEvent::Disconnected {
            reason: reason.clone(),
        });
        self.should_reconnect(&reason)
    }

    pub fn should_reconnect(&self, reason: &DisconnectReason) -> bool {
        self.auto_reconnect()
            && reason.auto_reconnectable()
            && self.state() != ConnectionState::Terminated
    }

    /// Runs the backoff schedule until the transport reconnects or the
    /// attempt ceiling is reached, which terminates the connection.
    ///
    /// The attempt count carries over between calls until
    /// [`confirm_session`](Self::confirm_session) resets it, so a link that
    /// reconnects but never gets a reply still runs out of attempts.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        loop {
            if self.state() == ConnectionState::Terminated {
                return Err(ConnectionError::Terminated);
            }

            let (delay, attempt, remaining) = {
                let mut backoff = self.backoff.lock();
                let delay = backoff.next_delay();
                (delay, backoff.attempts(), backoff.remaining())
            };
            let Some(delay) = delay else {
                warn!("Giving up after {} reconnection attempts", attempt);
                self.transition(ConnectionState::Terminated);
                return Err(ConnectionError::AttemptsExhausted(attempt));
            };

            self.transition(ConnectionState::Reconnecting);
            info!("Reconnection attempt {} in {:?}", attempt, delay);
            self.listeners.notify(&ConnectionEvent::ReconnectScheduled {
                attempt,
                remaining,
                delay,
            });
            tokio::time::sleep(delay).await;

            if self.state() == ConnectionState::Terminated {
                return Err(ConnectionError::Terminated);
            }

            match self.transport.connect().await {
                Ok(()) => {
                    info!("Reconnected on attempt {}", attempt);
                    self.record_heartbeat();
                    self.transition(ConnectionState::Connected);
                    self.listeners.notify(&ConnectionEvent::Resynchronizing);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", attempt, e);
                    self.listeners.notify(&ConnectionEvent::ReconnectFailed {
                        attempt,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Marks the remote session as re-established and resets the schedule.
    pub fn confirm_session(&self) {
        self.backoff.lock().reset();
        self.record_heartbeat();
    }

    pub fn record_heartbeat(&self) {
        *self.last_heard.lock() = Instant::now();
    }

    pub fn heartbeat_expired(&self) -> bool {
        self.last_heard.lock().elapsed() > self.config.heartbeat.timeout
    }

    /// Closes the connection for good.
    pub async fn close(&self) {
        self.set_auto_reconnect(false);
        if let Err(e) = self.transport.close().await {
            warn!("Error closing transport: {}", e);
        }
        if self.state() != ConnectionState::Terminated {
            self.listeners.notify(&ConnectionEvent::Disconnected {
                reason: DisconnectReason::UserClosed,
            });
            self.transition(ConnectionState::Terminated);
        }
    }
}

/// Recovery strategy that re-establishes the transport
pub struct ReconnectStrategy<T: Transport> {
    manager: Arc<ConnectionManager<T>>,
    priority: i32,
}

impl<T: Transport> ReconnectStrategy<T> {
    pub fn new(manager: Arc<ConnectionManager<T>>) -> Self {
        Self {
            manager,
            priority: 70,
        }
    }
}

impl<T: Transport + 'static> RecoveryStrategy for ReconnectStrategy<T> {
    fn name(&self) -> &str {
        "transport-reconnect"
    }

    fn kind(&self) -> RecoveryStrategyKind {
        RecoveryStrategyKind::Reconnect
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_recover(&self, error: &TypedError) -> bool {
        error.strategy == RecoveryStrategyKind::Reconnect
            && self.manager.auto_reconnect()
            && self.manager.state() != ConnectionState::Terminated
    }

    fn attempt_recovery(&self, _error: &TypedError, _context: &RecoveryContext) -> RecoveryFuture {
        let manager = Arc::clone(&self.manager);
        Box::pin(async move {
            let started = Instant::now();
            let result = manager.reconnect().await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(()) => RecoveryResult::success("transport reconnected", duration_ms),
                Err(ConnectionError::Terminated) => RecoveryResult::Failure {
                    message: "connection was closed".to_string(),
                    duration_ms,
                    cause: Some(DisconnectReason::UserClosed.to_error()),
                },
                Err(e) => RecoveryResult::Failure {
                    message: e.to_string(),
                    duration_ms,
                    cause: Some(
                        TypedError::new(ErrorKind::ConnectionRefused, e.to_string()).unrecoverable(),
                    ),
                },
            }
        })
    }
}
