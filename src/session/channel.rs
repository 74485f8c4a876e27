//! Channel Session State Machine
//!
//! `INIT → CONNECTING → UP → READY → (DOWN | CLOSED)`, with `DOWN → CONNECTING` on the reconnect
//! timer. Every transition goes through `transition`, which logs it, updates metrics and emits
//! exactly one `ChannelEvent`. At most one connect is in flight at any time.
//!
//! Preferred host fallback: on an ioctl, a manual call or the detection timer the session drops
//! the primary connection and tries the preferred host; if that attempt fails it falls back to
//! the primary exactly once.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{millis, Nanos, NANOS_PER_MILLI};
use crate::config::SessionSettings;
use crate::error::{ErrorKind, WatchlistError};
use crate::session::backoff::BackoffCalculator;
use crate::session::transport::{ChannelTransport, TransportError, TransportEvent};
use crate::watchlist::msg::OutboundMsg;

// =============================================================================
// HOSTS & OPTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub host: String,
    pub port: u16,
}

impl HostDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for HostDescriptor {
    fn default() -> Self {
        Self::new("localhost", 14002)
    }
}

impl fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Preferred host fallback options. Changeable live through `Ioctl`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredHostOptions {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub host: Option<HostDescriptor>,

    /// Automatic fallback period while on the primary host; 0 disables the timer
    #[serde(default)]
    pub detection_interval_ms: u64,
}

impl PreferredHostOptions {
    fn target(&self) -> Option<&HostDescriptor> {
        if self.enabled {
            self.host.as_ref()
        } else {
            None
        }
    }
}

/// Live option changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ioctl {
    PreferredHostOptions(PreferredHostOptions),
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Init,
    Connecting,
    /// Transport connected, login not yet accepted
    Up,
    /// Login accepted
    Ready,
    /// Connection lost, waiting for the reconnect timer
    Down,
    Closed,
}

impl ChannelState {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Up | Self::Ready)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Up => write!(f, "UP"),
            Self::Ready => write!(f, "READY"),
            Self::Down => write!(f, "DOWN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionReason {
    ConnectRequested,
    Connected,
    LoginAccepted,
    ConnectFailed,
    Disconnected,
    ReconnectTimer,
    PreferredHostFallback,
    FallbackToPrimary,
    RetriesExhausted,
    LoginRejected,
    LoginRecovering,
    ShutdownRequested,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectRequested => write!(f, "connect_requested"),
            Self::Connected => write!(f, "connected"),
            Self::LoginAccepted => write!(f, "login_accepted"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::ReconnectTimer => write!(f, "reconnect_timer"),
            Self::PreferredHostFallback => write!(f, "preferred_host_fallback"),
            Self::FallbackToPrimary => write!(f, "fallback_to_primary"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::LoginRejected => write!(f, "login_rejected"),
            Self::LoginRecovering => write!(f, "login_recovering"),
            Self::ShutdownRequested => write!(f, "shutdown"),
        }
    }
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub from: ChannelState,
    pub to: ChannelState,
    pub reason: TransitionReason,
    pub host: Option<HostDescriptor>,
    pub at: Nanos,
}

impl ChannelEvent {
    /// The transition took the channel off a live connection.
    #[inline]
    pub fn lost_connection(&self) -> bool {
        self.from.is_connected() && !self.to.is_connected()
    }
}

// =============================================================================
// SESSION METRICS
// =============================================================================

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub connections_attempted: AtomicU64,
    pub connections_succeeded: AtomicU64,
    pub connections_failed: AtomicU64,
    pub reconnections: AtomicU64,
    pub fallbacks: AtomicU64,
    pub total_downtime_ms: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connections_attempted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_success(&self) {
        self.connections_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_downtime_ms(&self, ms: u64) {
        self.total_downtime_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} failed={} reconnects={} fallbacks={} downtime_ms={}",
            self.connections_succeeded.load(Ordering::Relaxed),
            self.connections_attempted.load(Ordering::Relaxed),
            self.connections_failed.load(Ordering::Relaxed),
            self.reconnections.load(Ordering::Relaxed),
            self.fallbacks.load(Ordering::Relaxed),
            self.total_downtime_ms.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// SESSION
// =============================================================================

pub struct ChannelSession {
    state: ChannelState,
    primary: HostDescriptor,
    preferred: PreferredHostOptions,
    /// Host of the in-flight or established connection
    current: Option<HostDescriptor>,
    /// The in-flight connect is a preferred host attempt
    trying_preferred: bool,
    backoff: BackoffCalculator,
    failed_attempts: u32,
    attempt_limit: i64,
    reconnect_at: Option<Nanos>,
    next_detection: Option<Nanos>,
    down_since: Option<Nanos>,
    auth_token: Option<String>,
    metrics: Arc<SessionMetrics>,
    transport: Box<dyn ChannelTransport>,
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("state", &self.state)
            .field("current", &self.current)
            .field("failed_attempts", &self.failed_attempts)
            .finish()
    }
}

impl ChannelSession {
    pub fn new(settings: &SessionSettings, transport: Box<dyn ChannelTransport>) -> Self {
        Self {
            state: ChannelState::Init,
            primary: settings.primary.clone(),
            preferred: settings.preferred.clone(),
            current: None,
            trying_preferred: false,
            backoff: BackoffCalculator::new(
                settings.reconnect_min_delay_ms,
                settings.reconnect_max_delay_ms,
                settings.jitter_factor,
                settings.jitter_seed,
            ),
            failed_attempts: 0,
            attempt_limit: settings.reconnect_attempt_limit,
            reconnect_at: None,
            next_detection: None,
            down_since: None,
            auth_token: None,
            metrics: Arc::new(SessionMetrics::new()),
            transport,
        }
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.state.is_connected()
    }

    pub fn current_host(&self) -> Option<&HostDescriptor> {
        self.current.as_ref()
    }

    /// Connected (or connecting) to the preferred host.
    pub fn on_preferred_host(&self) -> bool {
        match (self.preferred.target(), &self.current) {
            (Some(p), Some(c)) => p == c,
            _ => false,
        }
    }

    pub fn preferred_options(&self) -> &PreferredHostOptions {
        &self.preferred
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn reconnect_at(&self) -> Option<Nanos> {
        self.reconnect_at
    }

    pub fn next_detection(&self) -> Option<Nanos> {
        self.next_detection
    }

    /// Token presented on the next (re)connect.
    pub fn set_auth_token(&mut self, token: Option<String>) {
        self.auth_token = token;
    }

    fn transition(
        &mut self,
        to: ChannelState,
        reason: TransitionReason,
        now: Nanos,
        out: &mut Vec<ChannelEvent>,
    ) {
        let from = self.state;
        self.state = to;

        match to {
            ChannelState::Connecting => {
                self.metrics.record_connect_attempt();
                if let Some(since) = self.down_since.take() {
                    self.metrics
                        .add_downtime_ms(((now - since).max(0) / NANOS_PER_MILLI) as u64);
                }
            }
            ChannelState::Up => {
                self.metrics.record_connect_success();
                self.backoff.reset();
                self.failed_attempts = 0;
            }
            ChannelState::Down => {
                self.down_since = Some(now);
            }
            _ => {}
        }

        info!(
            from = %from,
            to = %to,
            reason = %reason,
            host = ?self.current.as_ref().map(|h| h.to_string()),
            "session_transition"
        );
        out.push(ChannelEvent {
            from,
            to,
            reason,
            host: self.current.clone(),
            at: now,
        });
    }

    /// Start a connect to `host` without a transition. Immediate failures are handled inline.
    fn connect_to(&mut self, host: HostDescriptor, now: Nanos, out: &mut Vec<ChannelEvent>) {
        let result = self.transport.connect(&host, self.auth_token.as_deref());
        if let Err(e) = result {
            debug!(host = %host, error = %e, "connect_rejected");
            self.connect_failed(now, out);
        }
    }

    fn begin_connect(
        &mut self,
        host: HostDescriptor,
        reason: TransitionReason,
        now: Nanos,
        out: &mut Vec<ChannelEvent>,
    ) {
        self.current = Some(host.clone());
        self.transition(ChannelState::Connecting, reason, now, out);
        self.connect_to(host, now, out);
    }

    /// First connect to the primary host.
    pub fn connect(&mut self, now: Nanos, out: &mut Vec<ChannelEvent>) -> Result<(), WatchlistError> {
        match self.state {
            ChannelState::Init => {
                let primary = self.primary.clone();
                self.begin_connect(primary, TransitionReason::ConnectRequested, now, out);
                Ok(())
            }
            ChannelState::Closed => Err(WatchlistError::new(
                ErrorKind::ChannelClosed,
                "channel is closed",
            )),
            _ => Err(WatchlistError::invalid("channel already started")),
        }
    }

    fn connect_failed(&mut self, now: Nanos, out: &mut Vec<ChannelEvent>) {
        self.metrics.record_connect_failure();

        if self.trying_preferred {
            self.trying_preferred = false;
            warn!(primary = %self.primary, "preferred_host_unreachable");
            let primary = self.primary.clone();
            self.current = Some(primary.clone());
            self.transition(
                ChannelState::Connecting,
                TransitionReason::FallbackToPrimary,
                now,
                out,
            );
            self.connect_to(primary, now, out);
            return;
        }

        self.transition(ChannelState::Down, TransitionReason::ConnectFailed, now, out);
        self.schedule_reconnect(now, out);
    }

    fn schedule_reconnect(&mut self, now: Nanos, out: &mut Vec<ChannelEvent>) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.next_detection = None;
        if self.attempt_limit >= 0 && i64::from(self.failed_attempts) > self.attempt_limit {
            self.transport.close();
            self.reconnect_at = None;
            self.transition(
                ChannelState::Closed,
                TransitionReason::RetriesExhausted,
                now,
                out,
            );
            return;
        }
        let delay = self.backoff.next_backoff();
        self.reconnect_at = Some(now.saturating_add(millis(delay.as_millis() as u64)));
        debug!(
            attempt = self.failed_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect_scheduled"
        );
    }

    fn arm_detection(&mut self, now: Nanos) {
        self.next_detection = match self.preferred.target() {
            Some(preferred)
                if self.preferred.detection_interval_ms > 0
                    && self.state.is_connected()
                    && self.current.as_ref() != Some(preferred) =>
            {
                Some(now.saturating_add(millis(self.preferred.detection_interval_ms)))
            }
            _ => None,
        };
    }

    pub fn on_transport_event(
        &mut self,
        event: TransportEvent,
        now: Nanos,
        out: &mut Vec<ChannelEvent>,
    ) {
        match event {
            TransportEvent::Connected { host } => {
                if self.state != ChannelState::Connecting || self.current.as_ref() != Some(&host) {
                    debug!(host = %host, state = %self.state, "stale_connect_ignored");
                    return;
                }
                self.trying_preferred = false;
                self.transition(ChannelState::Up, TransitionReason::Connected, now, out);
                self.arm_detection(now);
            }
            TransportEvent::ConnectFailed { host, reason } => {
                if self.state != ChannelState::Connecting || self.current.as_ref() != Some(&host) {
                    debug!(host = %host, state = %self.state, "stale_connect_failure_ignored");
                    return;
                }
                debug!(host = %host, reason = %reason, "connect_failed");
                self.connect_failed(now, out);
            }
            TransportEvent::Disconnected { reason } => {
                if !self.state.is_connected() {
                    return;
                }
                warn!(reason = %reason, "channel_disconnected");
                self.transition(ChannelState::Down, TransitionReason::Disconnected, now, out);
                self.schedule_reconnect(now, out);
            }
        }
    }

    pub fn login_accepted(&mut self, now: Nanos, out: &mut Vec<ChannelEvent>) {
        if self.state == ChannelState::Up {
            self.transition(ChannelState::Ready, TransitionReason::LoginAccepted, now, out);
        }
    }

    /// The provider refused the login for good.
    pub fn login_rejected(&mut self, now: Nanos, out: &mut Vec<ChannelEvent>) {
        if self.state.is_connected() {
            self.transport.close();
            self.transition(ChannelState::Closed, TransitionReason::LoginRejected, now, out);
        }
    }

    /// The provider closed the login with ClosedRecover: drop the connection and go through
    /// the normal reconnect path.
    pub fn login_recovering(&mut self, now: Nanos, out: &mut Vec<ChannelEvent>) {
        if !self.state.is_connected() {
            return;
        }
        self.transport.close();
        self.transition(ChannelState::Down, TransitionReason::LoginRecovering, now, out);
        self.schedule_reconnect(now, out);
    }

    /// Reconnect timer and preferred host detection timer.
    pub fn poll(&mut self, now: Nanos, out: &mut Vec<ChannelEvent>) {
        if self.state == ChannelState::Down {
            if let Some(at) = self.reconnect_at {
                if now >= at {
                    self.reconnect_at = None;
                    self.metrics.record_reconnection();
                    let primary = self.primary.clone();
                    self.begin_connect(primary, TransitionReason::ReconnectTimer, now, out);
                }
            }
            return;
        }

        if let Some(at) = self.next_detection {
            if self.state.is_connected() && now >= at {
                self.next_detection = None;
                let _ = self.fallback_to_preferred_host(now, out);
            }
        }
    }

    /// Switch to the preferred host.
    ///
    /// No-op while a connect is in flight or when already on the preferred host.
    pub fn fallback_to_preferred_host(
        &mut self,
        now: Nanos,
        out: &mut Vec<ChannelEvent>,
    ) -> Result<(), WatchlistError> {
        let Some(preferred) = self.preferred.target().cloned() else {
            return Err(WatchlistError::invalid("no preferred host configured"));
        };
        match self.state {
            ChannelState::Init => Err(WatchlistError::invalid("channel not started")),
            ChannelState::Closed => Err(WatchlistError::new(
                ErrorKind::ChannelClosed,
                "channel is closed",
            )),
            ChannelState::Connecting => {
                debug!("fallback_skipped_connect_in_flight");
                Ok(())
            }
            ChannelState::Up | ChannelState::Ready if self.current.as_ref() == Some(&preferred) => {
                Ok(())
            }
            ChannelState::Up | ChannelState::Ready | ChannelState::Down => {
                self.transport.close();
                self.reconnect_at = None;
                self.next_detection = None;
                self.trying_preferred = true;
                self.metrics.record_fallback();
                info!(preferred = %preferred, "preferred_host_fallback");
                self.begin_connect(preferred, TransitionReason::PreferredHostFallback, now, out);
                Ok(())
            }
        }
    }

    /// Apply live options without tearing the session down.
    pub fn ioctl(&mut self, ioctl: Ioctl, now: Nanos) {
        match ioctl {
            Ioctl::PreferredHostOptions(options) => {
                info!(
                    enabled = options.enabled,
                    host = ?options.host.as_ref().map(|h| h.to_string()),
                    detection_interval_ms = options.detection_interval_ms,
                    "preferred_host_options_changed"
                );
                self.preferred = options;
                self.arm_detection(now);
            }
        }
    }

    pub fn shutdown(&mut self, now: Nanos, out: &mut Vec<ChannelEvent>) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.transport.close();
        self.reconnect_at = None;
        self.next_detection = None;
        self.transition(
            ChannelState::Closed,
            TransitionReason::ShutdownRequested,
            now,
            out,
        );
        info!(metrics = %self.metrics.summary(), "session_closed");
    }

    /// Write and flush encode-ready messages. Nothing is written unless connected.
    pub fn write(&mut self, msgs: &[OutboundMsg]) -> Result<usize, TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        for msg in msgs {
            self.transport.write(msg)?;
        }
        self.transport.flush()?;
        Ok(msgs.len())
    }
}
