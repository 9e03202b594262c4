//! Per-tool circuit breakers.
//!
//! The registry keeps one breaker per tool id. Lookups take a shared read
//! lock on the map; every state mutation for a tool is serialised by that
//! tool's own mutex, so two executions hammering the same failing tool never
//! double-count a failure or both win the half-open probe slot.

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before a half-open probe is allowed (ms)
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Growth factor of the open window after each failed probe
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for the open window (ms)
    #[serde(default = "default_max_open_timeout_ms")]
    pub max_open_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_timeout_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_open_timeout_ms() -> u64 {
    600_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_open_timeout_ms: default_max_open_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Open window after `trips` consecutive re-openings.
    pub fn open_window(&self, trips: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(trips.min(32) as i32);
        let ms = (self.open_timeout_ms as f64 * factor).min(self.max_open_timeout_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// One probe in flight, testing if the tool recovered
    HalfOpen,
    /// Failing fast until `next_half_open_at`
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::HalfOpen => write!(f, "half_open"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Returned when a call is not allowed through the breaker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker for '{tool_id}' is {state}")]
pub struct CircuitRejection {
    pub tool_id: String,
    pub state: CircuitState,
    pub next_half_open_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub tool_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub next_half_open_at: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_half_open_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    /// Re-openings since the breaker was last closed; drives the open window.
    consecutive_trips: u32,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_half_open_at: None,
            probe_in_flight: false,
            consecutive_trips: 0,
        }
    }

    fn snapshot(&self, tool_id: &str) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            tool_id: tool_id.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            next_half_open_at: self.next_half_open_at,
            probe_in_flight: self.probe_in_flight,
        }
    }
}

/// Whether a permit is an ordinary call or the single half-open probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitKind {
    Normal,
    Probe,
}

struct RegistryInner {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<Mutex<BreakerEntry>>>>,
    trips: AtomicU64,
    rejections: AtomicU64,
}

/// Registry of circuit breakers keyed by tool id.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RegistryInner>,
}

/// Permission to make one call against a tool.
///
/// Settle it with [`CallPermit::succeed`] or [`CallPermit::fail`]. Dropping an
/// unsettled probe permit frees the half-open slot without changing state.
pub struct CallPermit {
    tool_id: String,
    kind: PermitKind,
    inner: Arc<RegistryInner>,
    settled: bool,
}

impl CallPermit {
    pub fn kind(&self) -> PermitKind {
        self.kind
    }

    pub fn tool_id(&self) -> &str {
        &self.tool_id
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.inner.settle(&self.tool_id, Some(self.kind), true);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.inner.settle(&self.tool_id, Some(self.kind), false);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Probe {
            let entry = self.inner.entry(&self.tool_id);
            let mut entry = entry.lock();
            entry.probe_in_flight = false;
            debug!(tool_id = %self.tool_id, "Unsettled probe permit released");
        }
    }
}

impl std::fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("tool_id", &self.tool_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl RegistryInner {
    fn entry(&self, tool_id: &str) -> Arc<Mutex<BreakerEntry>> {
        if let Some(entry) = self.breakers.read().get(tool_id) {
            return Arc::clone(entry);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(tool_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerEntry::new()))),
        )
    }

    fn open(&self, tool_id: &str, entry: &mut BreakerEntry, now: DateTime<Utc>) {
        let window = self.config.open_window(entry.consecutive_trips);
        let old_state = entry.state;
        entry.state = CircuitState::Open;
        entry.next_half_open_at =
            Some(now + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero()));
        entry.probe_in_flight = false;
        entry.consecutive_trips = entry.consecutive_trips.saturating_add(1);
        entry.success_count = 0;
        self.trips.fetch_add(1, Ordering::Relaxed);
        warn!(
            tool_id = %tool_id,
            old_state = %old_state,
            open_for_ms = window.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn close(&self, tool_id: &str, entry: &mut BreakerEntry) {
        let old_state = entry.state;
        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.success_count = 0;
        entry.next_half_open_at = None;
        entry.probe_in_flight = false;
        entry.consecutive_trips = 0;
        if old_state != CircuitState::Closed {
            info!(tool_id = %tool_id, old_state = %old_state, "Circuit breaker closed");
        }
    }

    /// Apply a call outcome. `kind` is `None` for outcomes reported without a
    /// permit, which are treated as coming from whoever holds the current slot.
    fn settle(&self, tool_id: &str, kind: Option<PermitKind>, success: bool) {
        let now = self.clock.now();
        let entry = self.entry(tool_id);
        let mut entry = entry.lock();

        match (entry.state, success) {
            (CircuitState::Closed, true) => {
                entry.failure_count = 0;
                entry.success_count = entry.success_count.saturating_add(1);
            }
            (CircuitState::Closed, false) => {
                entry.failure_count = entry.failure_count.saturating_add(1);
                entry.success_count = 0;
                debug!(tool_id = %tool_id, failure_count = entry.failure_count, "Failure recorded");
                if entry.failure_count >= self.config.failure_threshold {
                    self.open(tool_id, &mut entry, now);
                }
            }
            (CircuitState::HalfOpen, outcome) => {
                // Results from calls admitted before the breaker tripped do not
                // decide the probe.
                if kind == Some(PermitKind::Normal) {
                    return;
                }
                if outcome {
                    self.close(tool_id, &mut entry);
                } else {
                    entry.failure_count = entry.failure_count.saturating_add(1);
                    info!(tool_id = %tool_id, "Half-open probe failed, reopening circuit");
                    self.open(tool_id, &mut entry, now);
                }
            }
            // Late outcomes while open are ignored: rejected calls never count.
            (CircuitState::Open, _) => {}
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                clock,
                breakers: RwLock::new(HashMap::new()),
                trips: AtomicU64::new(0),
                rejections: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Ask permission to call `tool_id`.
    ///
    /// Closed breakers always admit. An open breaker rejects until its window
    /// elapses; the first caller after that becomes the half-open probe and
    /// everyone else is rejected until the probe settles.
    pub fn try_acquire(&self, tool_id: &str) -> Result<CallPermit, CircuitRejection> {
        let now = self.inner.clock.now();
        let entry = self.inner.entry(tool_id);
        let mut entry = entry.lock();

        let kind = match entry.state {
            CircuitState::Closed => PermitKind::Normal,
            CircuitState::Open => {
                let ready = entry.next_half_open_at.map(|at| now >= at).unwrap_or(true);
                if !ready {
                    self.inner.rejections.fetch_add(1, Ordering::Relaxed);
                    debug!(tool_id = %tool_id, "Circuit open, rejecting call");
                    return Err(CircuitRejection {
                        tool_id: tool_id.to_string(),
                        state: CircuitState::Open,
                        next_half_open_at: entry.next_half_open_at,
                    });
                }
                entry.state = CircuitState::HalfOpen;
                entry.probe_in_flight = true;
                info!(tool_id = %tool_id, "Circuit half-open, admitting probe");
                PermitKind::Probe
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    self.inner.rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(CircuitRejection {
                        tool_id: tool_id.to_string(),
                        state: CircuitState::HalfOpen,
                        next_half_open_at: entry.next_half_open_at,
                    });
                }
                entry.probe_in_flight = true;
                PermitKind::Probe
            }
        };

        Ok(CallPermit {
            tool_id: tool_id.to_string(),
            kind,
            inner: Arc::clone(&self.inner),
            settled: false,
        })
    }

    pub fn record_success(&self, tool_id: &str) {
        self.inner.settle(tool_id, None, true);
    }

    pub fn record_failure(&self, tool_id: &str) {
        self.inner.settle(tool_id, None, false);
    }

    /// Stored state of the breaker. Unknown tools are closed.
    pub fn get_state(&self, tool_id: &str) -> CircuitState {
        self.inner
            .breakers
            .read()
            .get(tool_id)
            .map(|e| e.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, tool_id: &str) -> CircuitBreakerSnapshot {
        match self.inner.breakers.read().get(tool_id) {
            Some(entry) => entry.lock().snapshot(tool_id),
            None => BreakerEntry::new().snapshot(tool_id),
        }
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut all: Vec<_> = self
            .inner
            .breakers
            .read()
            .iter()
            .map(|(id, entry)| entry.lock().snapshot(id))
            .collect();
        all.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        all
    }

    pub fn reset(&self, tool_id: &str) {
        if let Some(entry) = self.inner.breakers.read().get(tool_id) {
            let mut entry = entry.lock();
            self.inner.close(tool_id, &mut entry);
        }
    }

    /// Number of times any breaker has opened.
    pub fn trips(&self) -> u64 {
        self.inner.trips.load(Ordering::Relaxed)
    }

    /// Number of calls rejected without contacting the tool.
    pub fn rejections(&self) -> u64 {
        self.inner.rejections.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
