//! Per-service circuit breaker
//!
//! - **Closed**: probes flow normally; consecutive failures are counted.
//! - **Open**: after `failure_threshold` consecutive failures. No probe is
//!   dispatched until `cooldown` has elapsed since the circuit opened.
//! - **HalfOpen**: once the cooldown expires exactly one trial probe is
//!   admitted. Success closes the circuit, failure reopens it with a fresh
//!   cooldown.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Probing suspended until the cooldown expires
    Open,
    /// Cooldown expired; one trial probe allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// What the breaker allows right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit, probe normally
    Probe,
    /// The single half-open trial probe
    Trial,
    /// Circuit open; do not probe
    Reject,
}

/// A state change, for logging and metrics
pub type Transition = (CircuitState, CircuitState);

/// Failure-counting state machine guarding one service's probes
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    /// When the circuit last opened; `None` while closed
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(service: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            service: service.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    /// State as of `now`
    pub fn state_at(&self, now: Instant) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(_) if self.trial_in_flight => CircuitState::HalfOpen,
            Some(opened) if now.saturating_duration_since(opened) >= self.cooldown => {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
        }
    }

    /// Consecutive failures counted so far
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Time left until a trial is allowed; zero unless open
    pub fn remaining_cooldown(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(opened) if !self.trial_in_flight => {
                self.cooldown.saturating_sub(now.saturating_duration_since(opened))
            }
            _ => Duration::ZERO,
        }
    }

    /// Decide whether a probe may be dispatched. Admitting the half-open
    /// trial reserves it until [`record_success_at`](Self::record_success_at),
    /// [`record_failure_at`](Self::record_failure_at) or
    /// [`release_trial`](Self::release_trial).
    pub fn admit_at(&mut self, now: Instant) -> (Admission, Option<Transition>) {
        match self.state_at(now) {
            CircuitState::Closed => (Admission::Probe, None),
            CircuitState::Open => (Admission::Reject, None),
            CircuitState::HalfOpen if self.trial_in_flight => (Admission::Reject, None),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                info!(service = %self.service, "Circuit breaker half-open: sending trial probe");
                (
                    Admission::Trial,
                    Some((CircuitState::Open, CircuitState::HalfOpen)),
                )
            }
        }
    }

    /// A trial that was admitted but never probed goes back to waiting.
    /// The cooldown has already expired, so the next check gets the trial.
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    /// A probe succeeded
    pub fn record_success_at(&mut self, _now: Instant) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        self.opened_at.take().map(|_| {
            info!(service = %self.service, "Circuit breaker closed: service recovered");
            (CircuitState::HalfOpen, CircuitState::Closed)
        })
    }

    /// A probe failed
    pub fn record_failure_at(&mut self, now: Instant) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.trial_in_flight {
            self.trial_in_flight = false;
            self.opened_at = Some(now);
            info!(
                service = %self.service,
                cooldown = ?self.cooldown,
                "Circuit breaker reopened: trial probe failed"
            );
            return Some((CircuitState::HalfOpen, CircuitState::Open));
        }

        if self.opened_at.is_none() && self.consecutive_failures >= self.failure_threshold {
            self.opened_at = Some(now);
            info!(
                service = %self.service,
                failures = self.consecutive_failures,
                cooldown = ?self.cooldown,
                "Circuit breaker opened: service marked unhealthy"
            );
            return Some((CircuitState::Closed, CircuitState::Open));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    #[test]
    fn test_opens_exactly_at_threshold() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new("api", 5, COOLDOWN);
        for i in 1..5 {
            assert_eq!(cb.record_failure_at(now), None, "failure {i}");
            assert_eq!(cb.state_at(now), CircuitState::Closed);
        }
        assert_eq!(
            cb.record_failure_at(now),
            Some((CircuitState::Closed, CircuitState::Open))
        );
        assert_eq!(cb.state_at(now), CircuitState::Open);
        assert_eq!(cb.admit_at(now).0, Admission::Reject);
    }

    #[test]
    fn test_success_resets_count() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new("api", 3, COOLDOWN);
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.record_success_at(now), None);
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state_at(now), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_exactly_at_cooldown_expiry() {
        let opened = Instant::now();
        let mut cb = CircuitBreaker::new("api", 1, COOLDOWN);
        cb.record_failure_at(opened);

        let just_before = opened + COOLDOWN - Duration::from_nanos(1);
        assert_eq!(cb.state_at(just_before), CircuitState::Open);
        assert_eq!(cb.remaining_cooldown(just_before), Duration::from_nanos(1));
        assert_eq!(cb.state_at(opened + COOLDOWN), CircuitState::HalfOpen);
    }

    #[test]
    fn test_single_trial_then_close() {
        let opened = Instant::now();
        let expiry = opened + COOLDOWN;
        let mut cb = CircuitBreaker::new("api", 1, COOLDOWN);
        cb.record_failure_at(opened);

        assert_eq!(
            cb.admit_at(expiry),
            (
                Admission::Trial,
                Some((CircuitState::Open, CircuitState::HalfOpen))
            )
        );
        // only one trial at a time
        assert_eq!(cb.admit_at(expiry).0, Admission::Reject);

        assert_eq!(
            cb.record_success_at(expiry),
            Some((CircuitState::HalfOpen, CircuitState::Closed))
        );
        assert_eq!(cb.state_at(expiry), CircuitState::Closed);
        assert_eq!(cb.admit_at(expiry).0, Admission::Probe);
    }

    #[test]
    fn test_trial_failure_restarts_cooldown() {
        let opened = Instant::now();
        let expiry = opened + COOLDOWN;
        let mut cb = CircuitBreaker::new("api", 1, COOLDOWN);
        cb.record_failure_at(opened);
        cb.admit_at(expiry);

        assert_eq!(
            cb.record_failure_at(expiry),
            Some((CircuitState::HalfOpen, CircuitState::Open))
        );
        assert_eq!(cb.state_at(expiry + COOLDOWN / 2), CircuitState::Open);
        assert_eq!(cb.state_at(expiry + COOLDOWN), CircuitState::HalfOpen);
    }

    #[test]
    fn test_released_trial_is_offered_again() {
        let opened = Instant::now();
        let expiry = opened + COOLDOWN;
        let mut cb = CircuitBreaker::new("api", 1, COOLDOWN);
        cb.record_failure_at(opened);

        assert_eq!(cb.admit_at(expiry).0, Admission::Trial);
        cb.release_trial();
        assert_eq!(cb.admit_at(expiry).0, Admission::Trial);
    }
}
