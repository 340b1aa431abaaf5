//! Connection lifecycle as a plain value.
//!
//! [`Lifecycle`] owns the current [`ConnectionState`] and the [`Backoff`]
//! schedule. It performs no I/O, so the supervisor loop drives it and the
//! tests can walk it through failure sequences without a socket.

use std::time::Duration;

/// Where the session is in its connect/reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// Opening the WebSocket.
    Connecting,
    /// Socket open, handshake sent, waiting out the grace period.
    Handshaking,
    /// Probe succeeded; reader and keep-alive are running.
    Connected,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
    /// Rejected by the server. Terminal.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay after a failure.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Shortest delay any backoff will produce.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

impl BackoffPolicy {
    /// Raise `initial` to [`MIN_BACKOFF`] and `max` to at least `initial`.
    #[must_use]
    pub fn clamped(self) -> Self {
        let initial = self.initial.max(MIN_BACKOFF);
        Self {
            initial,
            max: self.max.max(initial),
        }
    }
}

/// Doubling delay capped at [`BackoffPolicy::max`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
}

impl Backoff {
    /// Start at the policy's initial delay, after [`BackoffPolicy::clamped`].
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        let policy = policy.clamped();
        Self {
            policy,
            next: policy.initial,
        }
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.policy.max);
        self.next = delay.saturating_mul(2).min(self.policy.max);
        delay
    }

    /// Back to the initial delay.
    pub const fn reset(&mut self) {
        self.next = self.policy.initial;
    }
}

/// State plus backoff, advanced by the supervisor.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    backoff: Backoff,
    attempt: u32,
}

impl Lifecycle {
    /// A fresh lifecycle in [`ConnectionState::Disconnected`].
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(policy),
            attempt: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connect.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the session has been rejected for good.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == ConnectionState::Failed
    }

    /// `Disconnected | Reconnecting -> Connecting`.
    pub fn connect_started(&mut self) -> bool {
        self.transition(
            &[ConnectionState::Disconnected, ConnectionState::Reconnecting],
            ConnectionState::Connecting,
        )
    }

    /// `Connecting -> Handshaking`.
    pub fn socket_opened(&mut self) -> bool {
        self.transition(&[ConnectionState::Connecting], ConnectionState::Handshaking)
    }

    /// `Handshaking -> Connected`; resets backoff and the attempt counter.
    pub fn probe_succeeded(&mut self) -> bool {
        let moved = self.transition(&[ConnectionState::Handshaking], ConnectionState::Connected);
        if moved {
            self.backoff.reset();
            self.attempt = 0;
        }
        moved
    }

    /// Any transient failure: `Connecting | Handshaking | Connected ->
    /// Reconnecting`. Returns the attempt number and the delay to wait, or
    /// `None` if the current state cannot fail over (e.g. already failed).
    pub fn connection_lost(&mut self) -> Option<(u32, Duration)> {
        let moved = self.transition(
            &[
                ConnectionState::Connecting,
                ConnectionState::Handshaking,
                ConnectionState::Connected,
            ],
            ConnectionState::Reconnecting,
        );
        if !moved {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some((self.attempt, self.backoff.next_delay()))
    }

    /// Fatal rejection. Allowed from any live state; never left afterwards.
    pub fn rejected(&mut self) -> bool {
        self.transition(
            &[
                ConnectionState::Connecting,
                ConnectionState::Handshaking,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
            ],
            ConnectionState::Failed,
        )
    }

    /// Orderly stop. `Failed` stays `Failed`.
    pub fn shutdown(&mut self) {
        if self.state != ConnectionState::Failed {
            tracing::debug!(from = %self.state, to = %ConnectionState::Disconnected, "state transition");
            self.state = ConnectionState::Disconnected;
        }
    }

    fn transition(&mut self, allowed_from: &[ConnectionState], to: ConnectionState) -> bool {
        if !allowed_from.contains(&self.state) {
            tracing::warn!(from = %self.state, to = %to, "refusing invalid state transition");
            return false;
        }
        tracing::debug!(from = %self.state, to = %to, "state transition");
        self.state = to;
        true
    }
}
