//! Pacing and circuit-breaking for remote calls.
//!
//! A pure coordinator: it owns no I/O, only the decision of whether a call
//! may proceed right now. Callers acquire a [`Ticket`] before making a
//! remote call and report the [`Outcome`] afterward so the rolling window
//! can account for it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tunables for [`RateGuard`]. Defaults are conservative (≈20 rpm, ≈3 s
/// gap) to keep small-scale deployments below per-tier limits; the
/// Orchestrator is expected to source these from configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateGuardConfig {
    pub requests_per_minute: u32,
    pub min_interval: Duration,
    pub window: Duration,
    pub error_rate_trip_threshold: f64,
    pub consecutive_rate_limit_trip: u32,
    pub open_cooldown: Duration,
}

impl Default for RateGuardConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            min_interval: Duration::from_secs(3),
            window: Duration::from_secs(60),
            error_rate_trip_threshold: 0.05,
            consecutive_rate_limit_trip: 3,
            open_cooldown: Duration::from_secs(30),
        }
    }
}

/// The outcome an Orchestrator worker reports back after making a gated
/// remote call, so the rolling window can account for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    ServerError,
    OtherError,
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

/// What [`RateGuard::acquire`] hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ticket {
    /// The call may proceed.
    Go,
    /// Dispatch should skip this work item and back off; the breaker is
    /// OPEN or pacing has not yet elapsed.
    Skip,
}

#[derive(Debug)]
struct WindowEntry {
    at: Instant,
    outcome: Outcome,
}

/// Token-bucket pacing plus a rolling-window circuit breaker. Scoped to a
/// single Orchestrator invocation.
#[derive(Debug)]
pub struct RateGuard {
    config: RateGuardConfig,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    last_request_at: Option<Instant>,
    window: VecDeque<WindowEntry>,
    state: CircuitState,
    consecutive_rate_limited: u32,
    half_open_probe_in_flight: bool,
}

impl RateGuard {
    pub fn new(config: RateGuardConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                last_request_at: None,
                window: VecDeque::new(),
                state: CircuitState::Closed,
                consecutive_rate_limited: 0,
                half_open_probe_in_flight: false,
            }),
        }
    }

    /// Ask whether a call may proceed right now. Does not block; the
    /// Orchestrator's dispatch loop sleeps for pacing itself and retries.
    pub async fn acquire(&self) -> Ticket {
        let mut inner = self.inner.lock().await;
        self.evict_stale(&mut inner);

        let pacing_multiplier = match inner.state {
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_cooldown {
                    info!("circuit breaker cooling down, entering HALF-OPEN");
                    inner.state = CircuitState::HalfOpen;
                    1
                } else {
                    return Ticket::Skip;
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    return Ticket::Skip;
                }
                3
            }
            CircuitState::Closed => 1,
        };

        let min_interval = self.config.min_interval * pacing_multiplier;
        if let Some(last) = inner.last_request_at {
            if last.elapsed() < min_interval {
                return Ticket::Skip;
            }
        }

        let rpm_window_start = Instant::now() - Duration::from_secs(60);
        let recent_requests = inner.window.iter().filter(|e| e.at >= rpm_window_start).count() as u32;
        if recent_requests >= self.config.requests_per_minute {
            return Ticket::Skip;
        }

        if matches!(inner.state, CircuitState::HalfOpen) {
            inner.half_open_probe_in_flight = true;
        }
        inner.last_request_at = Some(Instant::now());
        Ticket::Go
    }

    /// Record the outcome of a call gated by [`Self::acquire`], updating the
    /// rolling window and possibly tripping or resetting the breaker.
    pub async fn record(&self, outcome: Outcome) {
        let mut inner = self.inner.lock().await;
        self.evict_stale(&mut inner);
        let now = Instant::now();
        inner.window.push_back(WindowEntry { at: now, outcome });

        match outcome {
            Outcome::RateLimited => inner.consecutive_rate_limited += 1,
            _ => inner.consecutive_rate_limited = 0,
        }

        if matches!(inner.state, CircuitState::HalfOpen) {
            inner.half_open_probe_in_flight = false;
            match outcome {
                Outcome::Success => {
                    info!("half-open probe succeeded, circuit CLOSED");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_rate_limited = 0;
                }
                _ => {
                    warn!("half-open probe failed, circuit re-OPEN");
                    inner.state = CircuitState::Open { opened_at: now };
                }
            }
            return;
        }

        if matches!(inner.state, CircuitState::Closed) {
            let total = inner.window.len() as f64;
            let errors = inner
                .window
                .iter()
                .filter(|e| matches!(e.outcome, Outcome::RateLimited | Outcome::ServerError | Outcome::OtherError))
                .count() as f64;
            let error_rate = if total > 0.0 { errors / total } else { 0.0 };

            if error_rate > self.config.error_rate_trip_threshold
                || inner.consecutive_rate_limited >= self.config.consecutive_rate_limit_trip
            {
                warn!(error_rate, consecutive_rate_limited = inner.consecutive_rate_limited, "circuit OPEN");
                inner.state = CircuitState::Open { opened_at: now };
            }
        }
    }

    fn evict_stale(&self, inner: &mut Inner) {
        let cutoff = Instant::now().checked_sub(self.config.window).unwrap_or_else(Instant::now);
        while matches!(inner.window.front(), Some(entry) if entry.at < cutoff) {
            inner.window.pop_front();
        }
    }

    #[cfg(test)]
    async fn is_open(&self) -> bool {
        matches!(self.inner.lock().await.state, CircuitState::Open { .. })
    }
}
