use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_requests: u32,
    pub monitoring_window: Duration,
}

/// Serializable view of a breaker, stored in checkpoints. A connection that
/// was Open at shutdown is restored Open with its `opened_at` preserved, so
/// the recovery timer keeps running across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: Vec<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_successes: u32,
    pub half_open_probes: u32,
}

/// Per-connection circuit breaker.
///
/// Failures are counted inside a sliding monitoring window and successes
/// decrement the count, so the breaker opens only when at least
/// `failure_threshold` failures landed within the window. All timing runs on
/// caller-supplied `now` values; the breaker holds no clock of its own.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_successes: u32,
    half_open_probes: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            half_open_successes: 0,
            half_open_probes: 0,
        }
    }

    /// Current state after applying the Open → HalfOpen timer.
    pub fn state(&mut self, now: DateTime<Utc>) -> CircuitState {
        self.poll(now);
        self.state
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    /// Whether a request may pass right now. HalfOpen admits up to
    /// `half_open_requests` probes in arrival order.
    pub fn allow_request(&mut self, now: DateTime<Utc>) -> bool {
        self.poll(now);
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.half_open_probes < self.config.half_open_requests {
                    self.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a failure. Returns true when this failure tripped the breaker
    /// Closed → Open.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.poll(now);
        match self.state {
            CircuitState::Closed => {
                self.prune(now);
                self.failures.push_back(now);
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.trip(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // One failed probe reopens and restarts the recovery timer
                self.trip(now);
                false
            }
            CircuitState::Open => false,
        }
    }

    /// Record a success: decrements the windowed failure count in Closed,
    /// counts a probe success in HalfOpen.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.poll(now);
        match self.state {
            CircuitState::Closed => {
                self.failures.pop_front();
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_requests {
                    self.reset();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Emergency override: force Closed and clear all counters.
    pub fn force_close(&mut self) {
        self.reset();
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
        self.half_open_probes = 0;
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.opened_at = None;
        self.half_open_successes = 0;
        self.half_open_probes = 0;
    }

    fn poll(&mut self, now: DateTime<Utc>) {
        if self.state == CircuitState::Open {
            if let Some(opened) = self.opened_at {
                if now - opened >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    self.half_open_probes = 0;
                }
            }
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.config.monitoring_window;
        while matches!(self.failures.front(), Some(&t) if t < cutoff) {
            self.failures.pop_front();
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failures: self.failures.iter().copied().collect(),
            opened_at: self.opened_at,
            half_open_successes: self.half_open_successes,
            half_open_probes: self.half_open_probes,
        }
    }

    pub fn restore(config: BreakerConfig, snapshot: &BreakerSnapshot) -> Self {
        Self {
            config,
            state: snapshot.state,
            failures: snapshot.failures.iter().copied().collect(),
            opened_at: snapshot.opened_at,
            half_open_successes: snapshot.half_open_successes,
            half_open_probes: snapshot.half_open_probes,
        }
    }
}
