//! Circuit breaker guarding calls into best-effort collaborators
//! (experiment trackers, artifact mirrors) so their outages never stall
//! the governance path.
use std::time::{Duration, Instant};
use thiserror::Error;
use parking_lot::Mutex;
use tracing::{warn, debug};
use opentelemetry::{global, metrics::Counter};
use once_cell::sync::Lazy;

static CIRCUIT_OPEN: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("govern-resilience")
        .u64_counter("govern_resilience_circuit_open_total")
        .with_description("Number of times a circuit transitioned to open")
        .build()
});

static CALLS_SHED: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("govern-resilience")
        .u64_counter("govern_resilience_calls_shed_total")
        .with_description("Calls skipped because the circuit was open")
        .build()
});

#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("circuit open")]
    CircuitOpen,
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState { Closed, Open, HalfOpen }

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    state: Mutex<State>,
    half_open_after: Duration,
    failure_threshold: u32,
}

#[derive(Debug)]
struct State { failures: u32, opened_at: Option<Instant>, trial: bool }

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, half_open_after: Duration) -> Self {
        Self { name, state: Mutex::new(State { failures: 0, opened_at: None, trial: false }), half_open_after, failure_threshold: failure_threshold.max(1) }
    }

    pub fn state(&self) -> BreakerState {
        let st = self.state.lock();
        match st.opened_at {
            None if st.trial => BreakerState::HalfOpen,
            None => BreakerState::Closed,
            Some(opened) if opened.elapsed() >= self.half_open_after => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    /// Whether a call may proceed. An expired open circuit lets one trial through.
    pub fn allow(&self) -> bool {
        let mut st = self.state.lock();
        if let Some(opened) = st.opened_at {
            if opened.elapsed() >= self.half_open_after {
                debug!(breaker = self.name, "half-open trial");
                st.opened_at = None;
                st.trial = true;
                return true;
            }
            return false;
        }
        true
    }

    pub fn record_success(&self) { let mut st = self.state.lock(); st.failures = 0; st.trial = false; }

    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.failures += 1;
        if (st.trial || st.failures >= self.failure_threshold) && st.opened_at.is_none() {
            st.opened_at = Some(Instant::now());
            st.trial = false;
            CIRCUIT_OPEN.add(1, &[]);
            warn!(breaker = self.name, failures = st.failures, "circuit opened");
        }
    }

    /// Run `op` through the breaker.
    pub fn call<T, E, F>(&self, op: F) -> Result<T, ResilienceError<E>>
    where F: FnOnce() -> Result<T, E> {
        if !self.allow() {
            CALLS_SHED.add(1, &[]);
            return Err(ResilienceError::CircuitOpen);
        }
        match op() {
            Ok(v) => { self.record_success(); Ok(v) }
            Err(e) => { self.record_failure(); Err(ResilienceError::Inner(e)) }
        }
    }
}
