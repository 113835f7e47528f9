//! Connection Manager Module
//!
//! The reconnecting connection lifecycle as a plain state machine. The manager
//! never touches a socket or a clock: the driver in `client` feeds it `Event`s
//! (timer firings and transport callbacks, each stamped with its arrival
//! `Instant`) and carries out the `Action`s it returns.
//!
//! ```text
//! Idle ---------TimerFired(Reconnect)--> Connecting
//! Connecting ---ConnectFailed----------> PendingRetry
//! Connecting ---Established------------> Established
//! Established --Message----------------> Established (stats updated)
//! Established --Closed-----------------> PendingRetry
//! PendingRetry -TimerFired(Reconnect)--> Connecting
//! ```
//!
//! Once the retry budget is exhausted the manager stays in `PendingRetry`
//! with no reconnect timer armed; the process keeps running (and keeps
//! reporting nothing) until interrupted.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::stats::{IntervalSummary, Series, StatsAggregator};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Established,
    PendingRetry,
}

/// Timers owned by the driver, one deadline per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconnect,
    Summary,
}

/// Delay growth between consecutive failed connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base_interval * 2^attempt`
    Exponential,
    /// Always `base_interval`
    Fixed,
}

impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(Backoff::Exponential),
            "fixed" => Ok(Backoff::Fixed),
            other => Err(format!("unknown backoff '{}'", other)),
        }
    }
}

/// Retry budget and delay computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub base_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential,
            base_interval: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_interval,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.base_interval.saturating_mul(factor)
            }
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Process start: arm the first connect and the summary timer.
    Start,
    TimerFired(TimerKind),
    /// Connection initiation was rejected, or the transport failed before
    /// the handshake completed.
    ConnectFailed(String),
    Established { at: Instant },
    Message { payload: Vec<u8>, at: Instant },
    /// Peer or transport closed an established connection.
    Closed { reason: Option<String> },
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a connection to the configured endpoint.
    Connect,
    /// Write a text frame on the open connection.
    Send(String),
    /// Arm (or re-arm) the timer of this kind.
    Schedule { timer: TimerKind, delay: Duration },
    /// An interval summary with at least one non-empty series.
    Report(IntervalSummary),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::PendingRetry => "pending-retry",
        };
        f.write_str(name)
    }
}

/// Reconnecting connection manager and owner of the interval statistics
pub struct ConnectionManager {
    state: ConnectionState,
    policy: RetryPolicy,
    attempt_count: u32,
    subscribe_frame: String,
    summary_interval: Duration,
    stats: StatsAggregator,
    /// Arrival time of the previous message, or of establishment before the
    /// first message.
    latency_epoch: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        policy: RetryPolicy,
        subscribe_frame: String,
        summary_interval: Duration,
        stats: StatsAggregator,
    ) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            attempt_count: 0,
            subscribe_frame,
            summary_interval,
            stats,
            latency_epoch: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// True once the retry budget is spent and no reconnect will be scheduled.
    pub fn is_exhausted(&self) -> bool {
        self.state == ConnectionState::PendingRetry && self.attempt_count >= self.policy.max_attempts
    }

    /// Advance the state machine by one event
    pub fn handle_event(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Start => vec![
                Self::schedule(TimerKind::Reconnect, Duration::ZERO),
                Self::schedule(TimerKind::Summary, self.summary_interval),
            ],
            Event::TimerFired(TimerKind::Reconnect) => self.on_reconnect_timer(),
            Event::TimerFired(TimerKind::Summary) => self.on_summary_timer(),
            Event::ConnectFailed(reason) => self.on_connect_failure(&reason),
            Event::Established { at } => self.on_established(at),
            Event::Message { payload, at } => {
                self.on_message(&payload, at);
                Vec::new()
            }
            Event::Closed { reason } => self.on_closed(reason.as_deref()),
        }
    }

    fn schedule(timer: TimerKind, delay: Duration) -> Action {
        Action::Schedule { timer, delay }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("Connection state: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn on_reconnect_timer(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Established => {
                log::debug!("Reconnect timer fired while {}, ignoring", self.state);
                Vec::new()
            }
            ConnectionState::Idle | ConnectionState::PendingRetry => {
                self.transition(ConnectionState::Connecting);
                vec![Action::Connect]
            }
        }
    }

    fn on_summary_timer(&mut self) -> Vec<Action> {
        let summary = self.stats.tick();
        let mut actions = Vec::with_capacity(2);
        if !summary.is_empty() {
            actions.push(Action::Report(summary));
        }
        actions.push(Self::schedule(TimerKind::Summary, self.summary_interval));
        actions
    }

    fn on_connect_failure(&mut self, reason: &str) -> Vec<Action> {
        log::error!("Client connect failed: {}", reason);
        self.transition(ConnectionState::PendingRetry);
        self.latency_epoch = None;

        match self.next_retry(|policy, attempt| policy.delay_for(attempt)) {
            Some(delay) => vec![Self::schedule(TimerKind::Reconnect, delay)],
            None => Vec::new(),
        }
    }

    fn on_established(&mut self, at: Instant) -> Vec<Action> {
        log::info!("Connected to feed");
        self.transition(ConnectionState::Established);
        self.attempt_count = 0;
        self.stats.reset();
        self.latency_epoch = Some(at);

        vec![
            Self::schedule(TimerKind::Summary, self.summary_interval),
            Action::Send(self.subscribe_frame.clone()),
        ]
    }

    fn on_message(&mut self, payload: &[u8], at: Instant) {
        if payload.is_empty() {
            return;
        }
        if self.state != ConnectionState::Established {
            log::debug!("Dropping {} byte message received while {}", payload.len(), self.state);
            return;
        }

        if let Some(epoch) = self.latency_epoch {
            let latency_us = at.saturating_duration_since(epoch).as_micros();
            self.stats
                .record(Series::Latency, u64::try_from(latency_us).unwrap_or(u64::MAX));
        }
        self.latency_epoch = Some(at);
        self.stats.record(Series::PriceProxy, payload.len() as u64);

        log::info!("Received: {}", String::from_utf8_lossy(payload));
    }

    fn on_closed(&mut self, reason: Option<&str>) -> Vec<Action> {
        match reason {
            Some(reason) => log::warn!("Connection closed: {}", reason),
            None => log::info!("Connection closed"),
        }
        self.transition(ConnectionState::PendingRetry);
        self.latency_epoch = None;

        match self.next_retry(|policy, _| policy.base_interval) {
            Some(delay) => vec![Self::schedule(TimerKind::Reconnect, delay)],
            None => Vec::new(),
        }
    }

    /// Spend one attempt from the budget and return the delay before the
    /// next connect, or `None` once the budget is exhausted.
    fn next_retry(&mut self, delay: impl Fn(&RetryPolicy, u32) -> Duration) -> Option<Duration> {
        if self.attempt_count >= self.policy.max_attempts {
            log::error!(
                "Retry budget of {} attempts exhausted, not reconnecting",
                self.policy.max_attempts
            );
            return None;
        }
        self.attempt_count += 1;
        let delay = delay(&self.policy, self.attempt_count);
        log::info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            self.attempt_count,
            self.policy.max_attempts
        );
        Some(delay)
    }
}
