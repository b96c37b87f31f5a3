//! Per-backend circuit breakers
//!
//! Each backend gets its own breaker guarded by its own lock, so concurrent
//! dispatches to the same backend observe a consistent state machine while
//! different backends never contend.

use crate::notifier::{AlertEvent, AlertNotifier};
use crate::routes::RouteTable;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// A single trial call is in flight
    HalfOpen,
}

/// Thresholds for a single breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl BreakerSettings {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    settings: BreakerSettings,
}

impl Breaker {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            settings,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }
}

/// Read-only view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Seconds since the breaker last opened, while not closed
    pub open_for_secs: Option<u64>,
}

/// What a recorded outcome did to the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    Tripped,
    Reopened,
    Closed,
}

/// Registry of circuit breakers, one per backend
///
/// The set of backends is fixed at construction. Each breaker sits behind
/// its own mutex so that [`is_call_permitted`](Self::is_call_permitted) and
/// [`record_outcome`](Self::record_outcome) are atomic per backend.
///
/// # Example
///
/// ```ignore
/// if registry.is_call_permitted("billing") {
///     let ok = forward().await.is_ok();
///     registry.record_outcome("billing", ok);
/// }
/// ```
pub struct BreakerRegistry {
    breakers: HashMap<String, Mutex<Breaker>>,
    notifier: Arc<dyn AlertNotifier>,
}

impl BreakerRegistry {
    pub fn new<I>(backends: I, notifier: Arc<dyn AlertNotifier>) -> Self
    where
        I: IntoIterator<Item = (String, BreakerSettings)>,
    {
        let breakers = backends
            .into_iter()
            .map(|(name, settings)| (name, Mutex::new(Breaker::new(settings))))
            .collect();
        Self { breakers, notifier }
    }

    /// One breaker per route, using each route's settings
    pub fn from_routes(routes: &RouteTable, notifier: Arc<dyn AlertNotifier>) -> Self {
        Self::new(
            routes.iter().map(|r| (r.name.clone(), r.breaker)),
            notifier,
        )
    }

    /// Check whether a call to `name` may proceed
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and permits exactly this call as the trial. Unknown names are always
    /// permitted.
    pub fn is_call_permitted(&self, name: &str) -> bool {
        self.is_call_permitted_at(name, Instant::now())
    }

    /// Record the outcome of a permitted call
    pub fn record_outcome(&self, name: &str, success: bool) {
        self.record_outcome_at(name, success, Instant::now())
    }

    pub(crate) fn is_call_permitted_at(&self, name: &str, now: Instant) -> bool {
        let Some(breaker) = self.breakers.get(name) else {
            return true;
        };
        let mut breaker = breaker.lock();

        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or_default();
                if elapsed >= breaker.settings.recovery_timeout {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.trial_in_flight = true;
                    info!(backend = name, "Circuit breaker half-open, allowing trial call");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if breaker.trial_in_flight {
                    false
                } else {
                    breaker.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub(crate) fn record_outcome_at(&self, name: &str, success: bool, now: Instant) {
        let Some(breaker) = self.breakers.get(name) else {
            debug!(backend = name, "Outcome for unknown backend ignored");
            return;
        };

        let (transition, failures) = {
            let mut breaker = breaker.lock();
            let transition = match (breaker.state, success) {
                (BreakerState::Closed, true) => {
                    breaker.consecutive_failures = 0;
                    Transition::None
                }
                (BreakerState::Closed, false) => {
                    breaker.consecutive_failures += 1;
                    if breaker.consecutive_failures >= breaker.settings.failure_threshold {
                        breaker.open(now);
                        Transition::Tripped
                    } else {
                        Transition::None
                    }
                }
                (BreakerState::HalfOpen, true) => {
                    breaker.close();
                    Transition::Closed
                }
                (BreakerState::HalfOpen, false) => {
                    breaker.consecutive_failures += 1;
                    breaker.open(now);
                    Transition::Reopened
                }
                // Late results of calls permitted before the trip
                (BreakerState::Open, true) => Transition::None,
                (BreakerState::Open, false) => {
                    breaker.consecutive_failures += 1;
                    Transition::None
                }
            };
            (transition, breaker.consecutive_failures)
        };

        match transition {
            Transition::Tripped => {
                warn!(backend = name, failures, "Circuit breaker opened");
                crate::metrics::record_breaker_state(name, true);
                self.notifier.notify(AlertEvent::breaker_tripped(name));
            }
            Transition::Reopened => {
                warn!(backend = name, "Trial call failed, circuit breaker reopened");
            }
            Transition::Closed => {
                info!(backend = name, "Trial call succeeded, circuit breaker closed");
                crate::metrics::record_breaker_state(name, false);
            }
            Transition::None => {}
        }
    }

    pub fn state(&self, name: &str) -> Option<BreakerState> {
        self.breakers.get(name).map(|b| b.lock().state)
    }

    pub fn snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
        let breaker = self.breakers.get(name)?.lock();
        Some(BreakerSnapshot {
            state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            failure_threshold: breaker.settings.failure_threshold,
            recovery_timeout_secs: breaker.settings.recovery_timeout.as_secs(),
            open_for_secs: breaker.opened_at.map(|t| t.elapsed().as_secs()),
        })
    }
}
