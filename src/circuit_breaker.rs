//! # Circuit Breaker Module
//!
//! Circuit breaker around calls to the external oracles. Repeated failures
//! open the circuit so later requests fall back locally without waiting on
//! a dead endpoint.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ocr_config::RecoveryConfig;

/// Circuit breaker for oracle calls
///
/// ```text
/// CLOSED ────failures ≥ threshold────► OPEN
///    ▲                                   │
///    └──────────reset timeout────────────┘
/// ```
///
/// After the reset timeout the counters are cleared and the next call is
/// let through; a success keeps the circuit closed, a failure starts the
/// count again.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    config: RecoveryConfig,
}

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            config,
        }
    }

    /// Whether calls should be blocked right now
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock();
        if state.failure_count < self.config.circuit_breaker_threshold {
            return false;
        }
        let reset_after = Duration::from_secs(self.config.circuit_breaker_reset_secs);
        match state.last_failure_time {
            Some(last) if last.elapsed() < reset_after => true,
            _ => {
                *state = BreakerState::default();
                false
            }
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());
    }

    pub fn record_success(&self) {
        *self.state.lock() = BreakerState::default();
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }
}

/// Exponential backoff with jitter: `min(base * 2^(attempt-1), max) + random(0, delay/4)`
pub fn calculate_retry_delay(attempt: u32, recovery: &RecoveryConfig) -> u64 {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let exponential_delay = recovery.base_retry_delay_ms as f64 * 2f64.powi(exponent);
    let delay = exponential_delay.min(recovery.max_retry_delay_ms as f64) as u64;

    let jitter_range = delay / 4;
    if jitter_range == 0 {
        return delay;
    }
    delay + rand::random::<u64>() % jitter_range
}
