//! Execution state types.

use super::ledger::PartialResultStore;
use crate::errors::{FlowhealError, Result};
use crate::self_healing::{CallContext, HealingResult, HealingUserOption};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    /// Waiting for a human decision on a critical error
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Failed
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained position within the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Initializing,
    /// Previous step settled, next one not yet started
    BetweenSteps,
    ExecutingStep,
    Healing,
    AwaitingDecision,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialStatus {
    Completed,
    /// Step was in flight when the execution stopped
    Partial,
    Skipped,
}

/// Outcome of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub step_index: usize,
    pub step_name: String,
    pub status: PartialStatus,
    pub artifacts: Vec<Value>,
    pub recorded_at: DateTime<Utc>,
}

/// An escalated healing result awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalError {
    pub healing: HealingResult,
    pub step_index: usize,
    pub step_name: String,
    pub possible_actions: Vec<HealingUserOption>,
    pub raised_at: DateTime<Utc>,
}

impl CriticalError {
    pub fn allows(&self, action_id: &str) -> bool {
        self.possible_actions.iter().any(|a| a.id == action_id)
    }
}

/// The human's answer to a [`CriticalError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalErrorDecision {
    pub action_id: String,
    pub input_value: Option<String>,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
}

impl CriticalErrorDecision {
    pub fn new(action_id: &str, decided_by: &str) -> Self {
        Self {
            action_id: action_id.to_string(),
            input_value: None,
            decided_by: decided_by.to_string(),
            decided_at: Utc::now(),
        }
    }

    pub fn with_input(mut self, input: &str) -> Self {
        self.input_value = Some(input.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: String,
    pub cancelled_by: String,
    pub cancelled_at: DateTime<Utc>,
}

/// Snapshot of one execution. Callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomousExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_name: Option<String>,
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub phase: ExecutionPhase,
    pub current_step_index: usize,
    pub current_step_name: Option<String>,
    pub total_steps: usize,
    /// Percentage of steps finished, 0 to 100
    pub progress: f64,
    pub current_cost: f64,
    pub estimated_total_cost: f64,
    pub critical_error: Option<CriticalError>,
    pub partial_results: PartialResultStore,
    pub final_results: Option<Vec<PartialResult>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub cancellation: Option<Cancellation>,
    pub last_decision: Option<CriticalErrorDecision>,
}

impl AutonomousExecutionState {
    pub(crate) fn new(
        execution_id: String,
        request: &ExecutionRequest,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id: request.workflow_id.clone(),
            workflow_name: request.workflow_name.clone(),
            user_id: request.user_id.clone(),
            status: ExecutionStatus::Running,
            phase: ExecutionPhase::Initializing,
            current_step_index: 0,
            current_step_name: request.steps.first().map(|s| s.name.clone()),
            total_steps: request.steps.len(),
            progress: 0.0,
            current_cost: 0.0,
            estimated_total_cost: request.steps.iter().map(|s| s.cost).sum(),
            critical_error: None,
            partial_results: PartialResultStore::new(),
            final_results: None,
            started_at,
            completed_at: None,
            estimated_completion_at: None,
            cancellation: None,
            last_decision: None,
        }
    }

    /// Move past the current step. Progress only ever grows.
    pub(crate) fn advance(&mut self) {
        self.current_step_index += 1;
        self.phase = ExecutionPhase::BetweenSteps;
        if self.total_steps > 0 {
            let progress = self.current_step_index as f64 / self.total_steps as f64 * 100.0;
            self.progress = self.progress.max(progress.min(100.0));
        }
    }
}

/// One tool invocation in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub tool_id: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    pub operation_id: String,
    #[serde(default = "default_operation_type")]
    pub operation_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Cost of one invocation
    #[serde(default)]
    pub cost: f64,
}

fn default_operation_type() -> String {
    "action".to_string()
}

impl WorkflowStep {
    pub fn new(name: &str, tool_id: &str, operation_id: &str) -> Self {
        Self {
            name: name.to_string(),
            tool_id: tool_id.to_string(),
            tool_name: None,
            operation_id: operation_id.to_string(),
            operation_type: default_operation_type(),
            payload: Value::Null,
            cost: 0.0,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn context(&self) -> CallContext {
        CallContext::new(&self.tool_id, &self.operation_id)
            .with_tool_name(self.tool_name.as_deref().unwrap_or(&self.tool_id))
            .with_operation_type(&self.operation_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(workflow_id: &str, steps: Vec<WorkflowStep>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_name: None,
            user_id: None,
            steps,
            metadata: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow_id.trim().is_empty() {
            return Err(FlowhealError::InvalidRequest(
                "workflow_id must not be empty".into(),
            ));
        }
        if self.steps.is_empty() {
            return Err(FlowhealError::InvalidRequest(
                "workflow has no steps".into(),
            ));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.tool_id.trim().is_empty() || step.operation_id.trim().is_empty() {
                return Err(FlowhealError::InvalidRequest(format!(
                    "step {} ('{}') needs a tool_id and an operation_id",
                    i, step.name
                )));
            }
            if !step.cost.is_finite() || step.cost < 0.0 {
                return Err(FlowhealError::InvalidRequest(format!(
                    "step {} ('{}') has invalid cost {}",
                    i, step.name, step.cost
                )));
            }
        }
        Ok(())
    }
}

/// Returned by `start_autonomous_execution` before any step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStarted {
    pub execution_id: String,
    pub state: AutonomousExecutionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    Started,
    StepStarted,
    StepCompleted,
    StepSkipped,
    Healing,
    NeedsDecision,
    Resumed,
    Completed,
    Failed,
    Cancelled,
}

/// Broadcast on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub kind: ExecutionEventKind,
    pub status: ExecutionStatus,
    pub step_index: usize,
    pub progress: f64,
    /// Set on `NeedsDecision`
    pub critical_error: Option<CriticalError>,
    pub timestamp: DateTime<Utc>,
}
