//! Per-provider fault isolation
//!
//! State machine: `Closed` → `Open` once `failure_threshold` failures land
//! inside `failure_window` (a true sliding window; stale entries are purged,
//! not bucketed). `Open` → `HalfOpen` after `reset_timeout`. `HalfOpen` →
//! `Closed` after `success_threshold` probe successes; any `HalfOpen`
//! failure reopens immediately with a fresh `reset_timeout`.
//!
//! Probe policy: exactly one probe is admitted while `HalfOpen`; concurrent
//! callers are rejected until that probe resolves. A cancelled probe must be
//! released via `report_cancelled` so it does not wedge the breaker.
//!
//! Slow-call detection (optional): calls slower than `threshold_ms` are
//! marked slow, and once at least `min_calls` are in the window with a slow
//! fraction of `rate` or more, the breaker opens as if the failure threshold
//! had been reached.

use crate::clock::Clock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowCallConfig {
    /// Calls slower than this count as slow
    pub threshold_ms: u64,
    /// Slow fraction at which the circuit opens (0.0 to 1.0)
    pub rate: f64,
    /// Minimum windowed call volume before the rate is evaluated
    pub min_calls: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,

    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    #[serde(default)]
    pub slow_call: Option<SlowCallConfig>,
}

fn default_failure_threshold() -> usize {
    5
}
fn default_reset_timeout_secs() -> u64 {
    30
}
fn default_success_threshold() -> usize {
    2
}
fn default_failure_window_secs() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            success_threshold: default_success_threshold(),
            failure_window_secs: default_failure_window_secs(),
            slow_call: None,
        }
    }
}

impl BreakerConfig {
    fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: Instant,
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window: VecDeque<CallRecord>,
    half_open_successes: usize,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
}

/// Per-provider circuit breaker. All state sits behind one component-local
/// mutex; nothing here is shared with other components.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                half_open_successes: 0,
                probe_in_flight: false,
                opened_at: None,
            }),
        }
    }

    /// Read-only view: would a request be admitted right now?
    ///
    /// Used by the orchestrator to select providers without consuming the
    /// half-open probe. The admission itself goes through `prepare_request`.
    pub fn allows_request(&self) -> bool {
        let now = self.clock.instant();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.probe_in_flight,
            CircuitState::Open => match inner.opened_at {
                Some(opened) => now.duration_since(opened) >= self.config.reset_timeout(),
                None => true,
            },
        }
    }

    /// Admit or reject a request before any network I/O.
    ///
    /// Performs the `Open` → `HalfOpen` transition once `reset_timeout` has
    /// elapsed and grants the single half-open probe to the caller.
    pub fn prepare_request(&self) -> bool {
        let now = self.clock.instant();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
            CircuitState::Open => {
                let elapsed = match inner.opened_at {
                    Some(opened) => now.duration_since(opened),
                    None => self.config.reset_timeout(),
                };
                if elapsed >= self.config.reset_timeout() {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    debug!("circuit transitioned to half-open, probe granted");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn report_success(&self, duration: Duration) {
        let now = self.clock.instant();
        let mut inner = self.inner.lock();
        self.purge(&mut inner, now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    debug!("circuit closed after successful probes");
                }
            }
            CircuitState::Closed => {
                let slow = self.is_slow(duration);
                inner.window.push_back(CallRecord {
                    at: now,
                    failed: false,
                    slow,
                });
                if slow && self.slow_rate_exceeded(&inner) {
                    self.trip(&mut inner, now);
                }
            }
            // Late completion from before the trip; nothing to count.
            CircuitState::Open => {}
        }
    }

    /// Record a completed failure. Returns true when this failure tripped
    /// the circuit open (so callers can count open events exactly once).
    pub fn report_failure(&self, duration: Duration) -> bool {
        let now = self.clock.instant();
        let mut inner = self.inner.lock();
        self.purge(&mut inner, now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                self.trip(&mut inner, now);
                true
            }
            CircuitState::Closed => {
                inner.window.push_back(CallRecord {
                    at: now,
                    failed: true,
                    slow: self.is_slow(duration),
                });
                let failures = inner.window.iter().filter(|r| r.failed).count();
                if failures >= self.config.failure_threshold || self.slow_rate_exceeded(&inner) {
                    self.trip(&mut inner, now);
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Release a granted probe without recording an outcome. Cancelled
    /// attempts are neither successes nor failures.
    pub fn report_cancelled(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// How long callers should wait before the circuit may admit a request
    pub fn retry_after(&self) -> Duration {
        let now = self.clock.instant();
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => self
                .config
                .reset_timeout()
                .saturating_sub(now.duration_since(opened)),
            _ => Duration::ZERO,
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.probe_in_flight = false;
        inner.half_open_successes = 0;
        inner.window.clear();
        debug!("circuit tripped open");
    }

    fn purge(&self, inner: &mut Inner, now: Instant) {
        let window = self.config.failure_window();
        while let Some(front) = inner.window.front() {
            if now.duration_since(front.at) >= window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_slow(&self, duration: Duration) -> bool {
        match &self.config.slow_call {
            Some(cfg) => duration >= Duration::from_millis(cfg.threshold_ms),
            None => false,
        }
    }

    fn slow_rate_exceeded(&self, inner: &Inner) -> bool {
        let Some(cfg) = &self.config.slow_call else {
            return false;
        };
        let total = inner.window.len();
        if total < cfg.min_calls {
            return false;
        }
        let slow = inner.window.iter().filter(|r| r.slow).count();
        (slow as f64 / total as f64) >= cfg.rate
    }
}
