//! Per-provider circuit breakers
//!
//! Closed/Open/HalfOpen state machine guarding upstream calls. `allow`
//! must run before each attempt; successes and failures feed back into
//! the state. One mutex per breaker; contention is negligible next to
//! the HTTP round-trip it guards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("breaker lock").state
    }

    /// Gate for the next upstream attempt. Open circuits flip to
    /// HalfOpen once the reset timeout has elapsed since the last
    /// failure.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("breaker lock");
        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= Duration::from_secs(self.config.reset_timeout_secs) {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        state.consecutive_failures = 0;
        if state.state == CircuitState::HalfOpen {
            state.half_open_successes += 1;
            if state.half_open_successes >= self.config.half_open_max {
                state.state = CircuitState::Closed;
                state.half_open_successes = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        state.last_failure = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// Lazily created breaker per provider name.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        BreakerRegistry {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_provider(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock");
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, reset_secs: u64, half_open_max: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_secs: reset_secs,
            half_open_max,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(config(3, 60, 1));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn open_flips_to_half_open_after_timeout() {
        let breaker = CircuitBreaker::new(config(1, 0, 1));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        // zero reset timeout: the very next allow probes
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let breaker = CircuitBreaker::new(config(1, 0, 2));
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(config(1, 0, 2));
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(config(3, 60, 1));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_hands_out_one_breaker_per_provider() {
        let registry = BreakerRegistry::new(config(1, 60, 1));
        let a = registry.for_provider("anthropic");
        let b = registry.for_provider("anthropic");
        a.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        let other = registry.for_provider("openai");
        assert_eq!(other.state(), CircuitState::Closed);
    }
}
