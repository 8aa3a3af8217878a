/// Fail-closed circuit breaker guarding the acoustic transport.
///
/// Closed → Open when `failure_threshold` failures land inside the
/// sliding `failure_window`. Open → HalfOpen once `recovery_timeout` has
/// elapsed, evaluated lazily on read (no timer). HalfOpen → Closed after
/// `successes_required` consecutive successes; any HalfOpen failure
/// re-trips immediately.
///
/// The breaker never falls back to another channel. An open breaker
/// only answers "no"; the caller owns any fallback decision.
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::now_ms;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Transport attempts refused.
    Open,
    /// Probing recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A state change, reported so the caller can audit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Result of asking the breaker for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Set when this read moved Open → HalfOpen.
    pub transition: Option<BreakerTransition>,
}

/// Snapshot returned by [`CircuitBreaker::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub state: CircuitState,
    /// Failures still inside the window.
    pub recent_failures: usize,
    pub half_open_successes: u32,
    pub last_tripped_at: Option<u64>,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<u64>,
    last_tripped_at: Option<u64>,
    half_open_successes: u32,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            last_tripped_at: None,
            half_open_successes: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
        }
    }
}

/// Health state machine for one transport.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// `false` only while the breaker is open.
    pub fn is_allowed(&self) -> bool {
        self.try_acquire_at(now_ms()).allowed
    }

    pub fn is_allowed_at(&self, now: u64) -> bool {
        self.try_acquire_at(now).allowed
    }

    /// Ask for permission and report any lazy Open → HalfOpen transition.
    pub fn try_acquire(&self) -> Admission {
        self.try_acquire_at(now_ms())
    }

    pub fn try_acquire_at(&self, now: u64) -> Admission {
        let mut inner = self.lock();
        let transition = self.advance_recovery(&mut inner, now);
        let allowed = inner.state != CircuitState::Open;
        if !allowed {
            inner.total_rejections += 1;
            debug!(
                remaining_ms = self.remaining_open_ms(&inner, now),
                "circuit open, refusing transport attempt"
            );
        }
        Admission {
            allowed,
            transition,
        }
    }

    /// Current state, with the time-gated transition applied.
    pub fn state(&self) -> CircuitState {
        self.state_at(now_ms())
    }

    pub fn state_at(&self, now: u64) -> CircuitState {
        let mut inner = self.lock();
        self.advance_recovery(&mut inner, now);
        inner.state
    }

    /// Record a successful transport attempt.
    pub fn record_success(&self) -> Option<BreakerTransition> {
        self.record_success_at(now_ms())
    }

    pub fn record_success_at(&self, now: u64) -> Option<BreakerTransition> {
        let mut inner = self.lock();
        self.advance_recovery(&mut inner, now);
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.successes_required.max(1) {
                    info!(
                        successes = inner.half_open_successes,
                        "circuit breaker closing after successful probes"
                    );
                    inner.state = CircuitState::Closed;
                    inner.half_open_successes = 0;
                    inner.failures.clear();
                    Some(BreakerTransition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                    })
                } else {
                    None
                }
            }
            // Open never regresses straight to Closed.
            CircuitState::Open => None,
        }
    }

    /// Record a failed transport attempt.
    pub fn record_failure(&self) -> Option<BreakerTransition> {
        self.record_failure_at(now_ms())
    }

    pub fn record_failure_at(&self, now: u64) -> Option<BreakerTransition> {
        let mut inner = self.lock();
        self.advance_recovery(&mut inner, now);
        inner.total_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune_failures(&mut inner, now);
                let threshold = self.config.failure_threshold.max(1) as usize;
                if inner.failures.len() >= threshold {
                    warn!(
                        failures = inner.failures.len(),
                        window_ms = self.config.failure_window_ms,
                        "circuit breaker tripped"
                    );
                    Some(Self::trip(&mut inner, CircuitState::Closed, now))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                warn!("failure while half-open, re-tripping circuit breaker");
                Some(Self::trip(&mut inner, CircuitState::HalfOpen, now))
            }
            CircuitState::Open => {
                inner.failures.push_back(now);
                self.prune_failures(&mut inner, now);
                None
            }
        }
    }

    /// Force the breaker back to Closed and forget failure history.
    pub fn reset(&self) -> Option<BreakerTransition> {
        let mut inner = self.lock();
        let from = inner.state;
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.half_open_successes = 0;
        inner.last_tripped_at = None;
        info!(from = %from, "circuit breaker reset");
        (from != CircuitState::Closed).then_some(BreakerTransition {
            from,
            to: CircuitState::Closed,
        })
    }

    pub fn stats(&self) -> BreakerStats {
        self.stats_at(now_ms())
    }

    pub fn stats_at(&self, now: u64) -> BreakerStats {
        let mut inner = self.lock();
        self.advance_recovery(&mut inner, now);
        self.prune_failures(&mut inner, now);
        BreakerStats {
            state: inner.state,
            recent_failures: inner.failures.len(),
            half_open_successes: inner.half_open_successes,
            last_tripped_at: inner.last_tripped_at,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejections: inner.total_rejections,
        }
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trip(inner: &mut BreakerInner, from: CircuitState, now: u64) -> BreakerTransition {
        inner.state = CircuitState::Open;
        inner.last_tripped_at = Some(now);
        inner.half_open_successes = 0;
        BreakerTransition {
            from,
            to: CircuitState::Open,
        }
    }

    /// Lazy Open → HalfOpen once the recovery timeout has elapsed.
    fn advance_recovery(&self, inner: &mut BreakerInner, now: u64) -> Option<BreakerTransition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let tripped_at = inner.last_tripped_at.unwrap_or(0);
        if now.saturating_sub(tripped_at) < self.config.recovery_timeout_ms {
            return None;
        }
        info!("circuit breaker transitioning to half-open");
        inner.state = CircuitState::HalfOpen;
        inner.half_open_successes = 0;
        Some(BreakerTransition {
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        })
    }

    fn prune_failures(&self, inner: &mut BreakerInner, now: u64) {
        let window = self.config.failure_window_ms;
        while let Some(&oldest) = inner.failures.front() {
            if now.saturating_sub(oldest) >= window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining_open_ms(&self, inner: &BreakerInner, now: u64) -> u64 {
        let tripped_at = inner.last_tripped_at.unwrap_or(now);
        self.config
            .recovery_timeout_ms
            .saturating_sub(now.saturating_sub(tripped_at))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
