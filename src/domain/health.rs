//! Per-backend health state and circuit breaker policy.
//!
//! Grounded on the reference implementation's `HealthStatus`/`health_policy.py`,
//! reshaped per the design note in SPEC_FULL.md section 9: instead of
//! reconstructing an immutable value on every transition, state lives behind a
//! per-backend mutex and is mutated in place (teacher's `AtomicU8` state-machine
//! pattern in `backend/mod.rs`, generalized from a 4-state enum to the
//! CLOSED/OPEN/HALF_OPEN circuit model this spec requires).

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// `CircuitBreakerSettings` — section 3.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_timeout", with = "crate::config::humantime_duration")]
    pub timeout: Duration,
    #[serde(default = "default_half_open_attempts")]
    pub half_open_attempts: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout: default_timeout(),
            half_open_attempts: default_half_open_attempts(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_half_open_attempts() -> u32 {
    3
}

/// `HealthCheckSettings` — section 3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval", with = "crate::config::humantime_duration")]
    pub interval: Duration,
    #[serde(default = "default_hc_timeout", with = "crate::config::humantime_duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval: default_interval(),
            timeout: default_hc_timeout(),
            endpoint: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_hc_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Exposes the unconfigured-default interval/timeout so `Config::load`'s
/// `MCP_HEALTH_CHECK_INTERVAL`/`MCP_HEALTH_CHECK_TIMEOUT` overrides (section
/// 6) can tell "left at the default" apart from an explicit per-backend
/// value without threading extra state through deserialization.
pub fn default_interval_for_env_override() -> Duration {
    default_interval()
}
pub fn default_timeout_for_env_override() -> Duration {
    default_hc_timeout()
}

/// Per-backend health state (section 3 `HealthState`). Lives behind a
/// `tokio::sync::Mutex` inside the registry entry; every method here assumes
/// exclusive access to `self` (the caller already holds the lock).
#[derive(Debug, Clone)]
pub struct HealthState {
    pub is_healthy: bool,
    pub last_check: Option<Instant>,
    pub error_count: u32,
    pub circuit_state: CircuitState,
    pub last_error: Option<String>,
    pub failure_timestamps: Vec<Instant>,
    /// Successes observed since the circuit most recently entered HALF_OPEN.
    /// Irrelevant (and left at 0) outside of that state.
    half_open_successes: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_check: None,
            error_count: 0,
            circuit_state: CircuitState::Closed,
            last_error: None,
            failure_timestamps: Vec::new(),
            half_open_successes: 0,
        }
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `record_success` — section 4.B. Closes the circuit unconditionally:
    /// a success while CLOSED is a no-op state-wise, a success while OPEN
    /// can only happen via an explicit half-open probe (see `prober.rs`),
    /// and a success while HALF_OPEN is routed through `record_half_open_success`
    /// instead so the consecutive-success count can be honored.
    pub fn record_success(&mut self) {
        self.is_healthy = true;
        self.last_check = Some(Instant::now());
        self.error_count = 0;
        self.circuit_state = CircuitState::Closed;
        self.last_error = None;
        self.failure_timestamps.clear();
        self.half_open_successes = 0;
    }

    /// `record_failure(msg)` — section 4.B.
    pub fn record_failure(&mut self, msg: impl Into<String>, settings: &CircuitBreakerSettings) {
        self.is_healthy = false;
        self.last_check = Some(Instant::now());
        self.error_count += 1;
        self.last_error = Some(msg.into());
        self.failure_timestamps.push(Instant::now());
        self.half_open_successes = 0;

        if self.circuit_state == CircuitState::HalfOpen {
            // A failure while half-open re-opens immediately and resets the timer
            // (section 4.C transition table).
            self.circuit_state = CircuitState::Open;
        } else if should_open(self, settings) {
            self.circuit_state = CircuitState::Open;
        }
    }

    /// Record a success observed while the circuit is HALF_OPEN. Closes the
    /// circuit once `half_open_attempts` consecutive successes accumulate
    /// (resolves Open Question #2 — SPEC_FULL.md section 4.B).
    pub fn record_half_open_success(&mut self, settings: &CircuitBreakerSettings) {
        self.half_open_successes += 1;
        self.last_check = Some(Instant::now());
        if should_close(self.half_open_successes, settings) {
            self.record_success();
        }
    }

    /// Transition CLOSED/OPEN → HALF_OPEN. Resets the half-open success counter.
    pub fn enter_half_open(&mut self) {
        self.circuit_state = CircuitState::HalfOpen;
        self.half_open_successes = 0;
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_state == CircuitState::Open
    }
}

/// `should_open` — section 4.C: pure function of current state + settings.
pub fn should_open(state: &HealthState, settings: &CircuitBreakerSettings) -> bool {
    state.error_count >= settings.failure_threshold
}

/// `should_attempt_half_open` — section 4.C.
pub fn should_attempt_half_open(state: &HealthState, settings: &CircuitBreakerSettings) -> bool {
    if state.circuit_state != CircuitState::Open {
        return false;
    }
    match state.failure_timestamps.last() {
        Some(last_failure) => last_failure.elapsed() >= settings.timeout,
        None => false,
    }
}

/// `should_close` — section 4.C.
pub fn should_close(success_count_in_half_open: u32, settings: &CircuitBreakerSettings) -> bool {
    success_count_in_half_open >= settings.half_open_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_success_resets_everything() {
        let mut state = HealthState::new();
        let settings = CircuitBreakerSettings::default();
        state.record_failure("boom", &settings);
        state.record_failure("boom again", &settings);
        assert_eq!(state.error_count, 2);

        state.record_success();
        assert_eq!(state.error_count, 0);
        assert_eq!(state.circuit_state, CircuitState::Closed);
        assert!(state.last_error.is_none());
        assert!(state.failure_timestamps.is_empty());
    }

    #[test]
    fn failure_threshold_one_opens_immediately() {
        let mut state = HealthState::new();
        let settings = CircuitBreakerSettings {
            failure_threshold: 1,
            ..Default::default()
        };
        state.record_failure("boom", &settings);
        assert_eq!(state.circuit_state, CircuitState::Open);
    }

    #[test]
    fn error_count_matches_failure_timestamps_len() {
        let mut state = HealthState::new();
        let settings = CircuitBreakerSettings::default();
        for _ in 0..4 {
            state.record_failure("boom", &settings);
        }
        assert_eq!(state.error_count as usize, state.failure_timestamps.len());
    }

    #[test]
    fn half_open_closes_after_configured_successes() {
        let mut state = HealthState::new();
        let settings = CircuitBreakerSettings {
            half_open_attempts: 3,
            ..Default::default()
        };
        state.enter_half_open();
        state.record_half_open_success(&settings);
        assert_eq!(state.circuit_state, CircuitState::HalfOpen);
        state.record_half_open_success(&settings);
        assert_eq!(state.circuit_state, CircuitState::HalfOpen);
        state.record_half_open_success(&settings);
        assert_eq!(state.circuit_state, CircuitState::Closed);
    }

    #[test]
    fn half_open_single_success_closes_when_attempts_is_one() {
        let mut state = HealthState::new();
        let settings = CircuitBreakerSettings {
            half_open_attempts: 1,
            ..Default::default()
        };
        state.enter_half_open();
        state.record_half_open_success(&settings);
        assert_eq!(state.circuit_state, CircuitState::Closed);
    }

    #[test]
    fn failure_during_half_open_reopens() {
        let mut state = HealthState::new();
        let settings = CircuitBreakerSettings::default();
        state.enter_half_open();
        state.record_half_open_success(&settings);
        state.record_failure("nope", &settings);
        assert_eq!(state.circuit_state, CircuitState::Open);
    }

    #[test]
    fn should_attempt_half_open_requires_timeout_elapsed() {
        let mut state = HealthState::new();
        let settings = CircuitBreakerSettings {
            failure_threshold: 1,
            timeout: Duration::from_millis(10),
            ..Default::default()
        };
        state.record_failure("boom", &settings);
        assert!(!should_attempt_half_open(&state, &settings));
        std::thread::sleep(Duration::from_millis(15));
        assert!(should_attempt_half_open(&state, &settings));
    }
}
