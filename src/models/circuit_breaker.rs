use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    failure_count: Arc<AtomicU32>,
    // set while the single half-open trial request is in flight
    trial_in_flight: Arc<AtomicBool>,
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitStateLabel {
    Closed,
    Open,
    HalfOpen,
}

/// How [`CircuitBreaker::try_acquire`] let a call through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single probing call of a half-open breaker.
    Trial,
}

impl CircuitState {
    pub fn label(&self) -> CircuitStateLabel {
        match self {
            CircuitState::Closed => CircuitStateLabel::Closed,
            CircuitState::Open { .. } => CircuitStateLabel::Open,
            CircuitState::HalfOpen => CircuitStateLabel::HalfOpen,
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: String, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        info!("Creating circuit breaker '{}' with threshold {} and timeout {:?}",
              name, failure_threshold, recovery_timeout);

        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            failure_count: Arc::new(AtomicU32::new(0)),
            trial_in_flight: Arc::new(AtomicBool::new(false)),
            name,
        }
    }

    pub fn with_config(name: String, config: &CircuitBreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.recovery_timeout)
    }

    /// Whether a request could be admitted right now. Does not claim the
    /// half-open trial slot.
    pub fn is_available(&self) -> bool {
        match *self.state.read() {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at } => opened_at.elapsed() >= self.recovery_timeout,
            CircuitState::HalfOpen => !self.trial_in_flight.load(Ordering::Acquire),
        }
    }

    /// Admits a request. An open breaker whose timeout has elapsed moves to
    /// half-open and hands out exactly one trial, no matter how many callers race.
    pub fn try_acquire(&self) -> Option<Admission> {
        {
            let state = self.state.read();
            match *state {
                CircuitState::Closed => return Some(Admission::Normal),
                CircuitState::Open { opened_at } if opened_at.elapsed() < self.recovery_timeout => {
                    debug!("Circuit breaker '{}' is open, rejecting call", self.name);
                    return None;
                }
                _ => {}
            }
        }

        let mut state = self.state.write();
        match *state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() < self.recovery_timeout {
                    return None;
                }
                *state = CircuitState::HalfOpen;
                self.trial_in_flight.store(true, Ordering::Release);
                info!("Circuit breaker '{}' transitioning to half-open", self.name);
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                let claimed = self
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if claimed {
                    debug!("Circuit breaker '{}' is half-open, allowing single test call", self.name);
                    Some(Admission::Trial)
                } else {
                    debug!("Circuit breaker '{}' half-open trial already in flight", self.name);
                    None
                }
            }
        }
    }

    /// Only the half-open trial's own success closes a recovering breaker.
    /// Outcomes of calls admitted before the breaker opened are ignored.
    pub fn record_success(&self, admission: Admission) {
        let mut state = self.state.write();
        match (*state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                *state = CircuitState::Closed;
                self.failure_count.store(0, Ordering::SeqCst);
                info!("Circuit breaker '{}' recovered, transitioning to closed", self.name);
            }
            (CircuitState::Closed, _) => {
                let previous_count = self.failure_count.swap(0, Ordering::SeqCst);
                if previous_count > 0 {
                    debug!("Circuit breaker '{}' reset failure count from {}", self.name, previous_count);
                }
            }
            (current, _) => {
                debug!("Circuit breaker '{}' ignoring late success while {:?}", self.name, current.label());
            }
        }
        if admission == Admission::Trial {
            self.trial_in_flight.store(false, Ordering::Release);
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut state = self.state.write();
        match (*state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                self.failure_count.fetch_add(1, Ordering::SeqCst);
                *state = CircuitState::Open { opened_at: Instant::now() };
                warn!("Circuit breaker '{}' re-opened during half-open test", self.name);
            }
            (CircuitState::Closed, _) => {
                let failure_count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Circuit breaker '{}' failure count: {}/{}", self.name, failure_count, self.failure_threshold);
                if failure_count >= self.failure_threshold {
                    *state = CircuitState::Open { opened_at: Instant::now() };
                    warn!("Circuit breaker '{}' opened due to {} consecutive failures",
                          self.name, failure_count);
                }
            }
            (current, _) => {
                debug!("Circuit breaker '{}' ignoring late failure while {:?}", self.name, current.label());
            }
        }
        if admission == Admission::Trial {
            self.trial_in_flight.store(false, Ordering::Release);
        }
    }

    /// Gives back a half-open trial whose outcome says nothing about the
    /// provider (for example a malformed request).
    pub fn release_trial(&self) {
        self.trial_in_flight.store(false, Ordering::Release);
    }

    pub fn get_state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn get_failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Open and still cooling down.
    pub fn is_open(&self) -> bool {
        match *self.state.read() {
            CircuitState::Open { opened_at } => opened_at.elapsed() < self.recovery_timeout,
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.read(), CircuitState::Closed)
    }

    pub fn is_half_open(&self) -> bool {
        matches!(*self.state.read(), CircuitState::HalfOpen)
    }

    pub fn force_open(&self) {
        let mut state = self.state.write();
        *state = CircuitState::Open { opened_at: Instant::now() };
        warn!("Circuit breaker '{}' manually opened", self.name);
    }

    pub fn force_close(&self) {
        let mut state = self.state.write();
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.trial_in_flight.store(false, Ordering::Release);
        info!("Circuit breaker '{}' manually closed and reset", self.name);
    }

    pub fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.get_state();

        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.label(),
            failure_count: self.get_failure_count(),
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitStateLabel,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
}
