//! Derived metrics for dashboards.
//!
//! Counters are updated as healing sessions and executions finish. Snapshots
//! are read-only views; nothing in the engine reads them back to make
//! decisions.

use crate::execution::AutonomousExecutionController;
use crate::self_healing::{HealingResult, HealingStrategy, HealingStrategyEngine};
use crate::supervision::CircuitBreakerSnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-strategy counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successful_attempts: u64,
    /// Sessions this strategy resolved
    pub resolutions: u64,
}

impl StrategyStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successful_attempts as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingMetricsSnapshot {
    pub total_healing_attempts: u64,
    pub successful_healings: u64,
    pub failed_healings: u64,
    pub escalations: u64,
    pub transient_error_resolution_rate: f64,
    pub circuit_breaker_trips: u64,
    pub avg_recovery_time_ms: f64,
    pub patterns_learned: u64,
    pub pattern_match_rate: f64,
    pub strategy_stats: BTreeMap<HealingStrategy, StrategyStats>,
}

/// Healing counters
#[derive(Debug, Default)]
pub struct HealingStats {
    sessions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    escalations: AtomicU64,
    transient_sessions: AtomicU64,
    transient_resolved: AtomicU64,
    recovery_time_total_ms: AtomicU64,
    strategies: Mutex<BTreeMap<HealingStrategy, StrategyStats>>,
}

impl HealingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self, strategy: HealingStrategy, success: bool) {
        let mut strategies = self.strategies.lock();
        let entry = strategies.entry(strategy).or_default();
        entry.attempts += 1;
        if success {
            entry.successful_attempts += 1;
        }
    }

    /// Record a finished session. `transient` reflects the original error.
    pub fn record_result(&self, result: &HealingResult, transient: bool) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        if transient {
            self.transient_sessions.fetch_add(1, Ordering::Relaxed);
        }
        if result.escalated {
            self.escalations.fetch_add(1, Ordering::Relaxed);
        }

        if result.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
            self.recovery_time_total_ms
                .fetch_add(result.total_duration_ms, Ordering::Relaxed);
            if transient {
                self.transient_resolved.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(strategy) = result.resolved_by {
                self.strategies.lock().entry(strategy).or_default().resolutions += 1;
            }
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(
        &self,
        circuit_breaker_trips: u64,
        patterns_learned: u64,
        pattern_match_rate: f64,
    ) -> HealingMetricsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let transient = self.transient_sessions.load(Ordering::Relaxed);
        let transient_resolved = self.transient_resolved.load(Ordering::Relaxed);
        let recovery_total = self.recovery_time_total_ms.load(Ordering::Relaxed);

        HealingMetricsSnapshot {
            total_healing_attempts: self.sessions.load(Ordering::Relaxed),
            successful_healings: successes,
            failed_healings: self.failures.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            transient_error_resolution_rate: ratio(transient_resolved, transient),
            circuit_breaker_trips,
            avg_recovery_time_ms: ratio(recovery_total, successes),
            patterns_learned,
            pattern_match_rate,
            strategy_stats: self.strategies.lock().clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetricsSnapshot {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    pub total_cost: f64,
    pub avg_cost_per_connection: f64,
}

/// Execution counters. A "connection" is one completed tool step.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    connections: AtomicU64,
    total_cost: Mutex<f64>,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection(&self, cost: f64) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        *self.total_cost.lock() += cost;
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutionMetricsSnapshot {
        let total_cost = *self.total_cost.lock();
        let connections = self.connections.load(Ordering::Relaxed);
        ExecutionMetricsSnapshot {
            total_executions: self.started.load(Ordering::Relaxed),
            successful_executions: self.completed.load(Ordering::Relaxed),
            failed_executions: self.failed.load(Ordering::Relaxed),
            cancelled_executions: self.cancelled.load(Ordering::Relaxed),
            total_cost,
            avg_cost_per_connection: if connections == 0 {
                0.0
            } else {
                total_cost / connections as f64
            },
        }
    }
}

/// Everything a dashboard needs in one read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub healing: HealingMetricsSnapshot,
    pub execution: ExecutionMetricsSnapshot,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
}

/// Reads engine and controller counters into one [`MetricsSnapshot`].
#[derive(Clone)]
pub struct MetricsAggregator {
    engine: Arc<HealingStrategyEngine>,
    controller: Option<AutonomousExecutionController>,
}

impl MetricsAggregator {
    pub fn new(engine: Arc<HealingStrategyEngine>) -> Self {
        Self {
            engine,
            controller: None,
        }
    }

    pub fn with_controller(mut self, controller: AutonomousExecutionController) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            healing: self.engine.metrics_snapshot(),
            execution: self
                .controller
                .as_ref()
                .map(|c| c.execution_metrics())
                .unwrap_or_else(|| ExecutionStats::new().snapshot()),
            circuit_breakers: self.engine.breakers().snapshots(),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
