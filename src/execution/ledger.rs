//! In-memory ledgers kept per execution.
//!
//! Nothing here is persisted. Callers get copies; only the controller writes.

use super::state::{PartialResult, PartialStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Ordered step outcomes for one execution, at most one per step index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialResultStore {
    results: Vec<PartialResult>,
}

impl PartialResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step outcome. Returns false if that step already has one.
    pub fn record(&mut self, result: PartialResult) -> bool {
        if self.contains(result.step_index) {
            return false;
        }
        self.results.push(result);
        true
    }

    pub fn contains(&self, step_index: usize) -> bool {
        self.results.iter().any(|r| r.step_index == step_index)
    }

    pub fn results(&self) -> &[PartialResult] {
        &self.results
    }

    pub fn snapshot(&self) -> Vec<PartialResult> {
        self.results.clone()
    }

    pub fn count(&self, status: PartialStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub event: String,
    pub message: String,
    pub step_index: Option<usize>,
}

/// Bounded per-execution event log. Oldest entries drop first.
pub struct ExecutionLog {
    capacity: usize,
    entries: Mutex<HashMap<String, VecDeque<ExecutionLogEntry>>>,
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(
        &self,
        execution_id: &str,
        level: LogLevel,
        event: &str,
        message: impl Into<String>,
        step_index: Option<usize>,
        timestamp: DateTime<Utc>,
    ) {
        let mut entries = self.entries.lock();
        let log = entries.entry(execution_id.to_string()).or_default();
        log.push_back(ExecutionLogEntry {
            execution_id: execution_id.to_string(),
            timestamp,
            level,
            event: event.to_string(),
            message: message.into(),
            step_index,
        });
        while log.len() > self.capacity {
            log.pop_front();
        }
    }

    pub fn entries(&self, execution_id: &str) -> Vec<ExecutionLogEntry> {
        self.entries
            .lock()
            .get(execution_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, execution_id: &str) {
        self.entries.lock().remove(execution_id);
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(500)
    }
}
