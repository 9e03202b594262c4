//! Autonomous workflow execution.
//!
//! The controller runs a workflow's steps in order, hands failures to the
//! healing engine, and pauses for a human decision when healing escalates.

use serde::{Deserialize, Serialize};

pub mod controller;
pub mod ledger;
pub mod state;
pub mod transport;

pub use controller::AutonomousExecutionController;
pub use ledger::{ExecutionLog, ExecutionLogEntry, LogLevel, PartialResultStore};
pub use state::{
    AutonomousExecutionState, Cancellation, CriticalError, CriticalErrorDecision,
    ExecutionEvent, ExecutionEventKind, ExecutionPhase, ExecutionRequest, ExecutionStarted,
    ExecutionStatus, PartialResult, PartialStatus, WorkflowStep,
};
pub use transport::ToolTransport;

/// Controller tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Finished executions kept in memory before the oldest is evicted
    #[serde(default = "default_retain_terminal")]
    pub retain_terminal: usize,
    /// Buffer of the execution event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Log entries kept per execution
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// How long a paused execution waits for a decision before aborting (ms)
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,
}

fn default_retain_terminal() -> usize {
    100
}
fn default_event_capacity() -> usize {
    256
}
fn default_log_capacity() -> usize {
    500
}
fn default_decision_timeout_ms() -> u64 {
    300_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retain_terminal: default_retain_terminal(),
            event_capacity: default_event_capacity(),
            log_capacity: default_log_capacity(),
            decision_timeout_ms: default_decision_timeout_ms(),
        }
    }
}
