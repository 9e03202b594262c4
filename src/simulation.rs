//! Scripted workflows
//!
//! Replays canned tool outcomes so workflows can be exercised without real
//! providers. A workflow file is YAML:
//!
//! ```yaml
//! workflow_id: daily-digest
//! steps:
//!   - name: fetch issues
//!     tool_id: github
//!     operation_id: list_issues
//!     cost: 0.01
//!     script:
//!       - error: { status: 503, message: "Service Unavailable" }
//!       - ok: { issues: 3 }
//! decisions:
//!   fetch issues: { action: skip-step }
//! ```
//!
//! Each `(tool_id, operation_id)` pair consumes its script in order; the last
//! outcome repeats once the script runs out. Pairs without a script succeed.

use crate::errors::ToolError;
use crate::execution::{ExecutionRequest, ToolTransport, WorkflowStep};
use crate::self_healing::OPTION_SKIP_STEP;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// One canned response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedOutcome {
    Ok(Value),
    Error(ToolError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedStep {
    #[serde(flatten)]
    pub step: WorkflowStep,
    /// Outcomes in call order, written as `- ok: ...` / `- error: ...`
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub script: Vec<ScriptedOutcome>,
    /// Simulated call latency
    #[serde(default)]
    pub latency_ms: u64,
}

/// Answer to give when a step escalates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedDecision {
    pub action: String,
    #[serde(default)]
    pub input: Option<String>,
}

impl Default for ScriptedDecision {
    fn default() -> Self {
        Self {
            action: OPTION_SKIP_STEP.to_string(),
            input: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedWorkflow {
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub steps: Vec<ScriptedStep>,
    /// Escalation answers keyed by step name
    #[serde(default)]
    pub decisions: HashMap<String, ScriptedDecision>,
}

impl ScriptedWorkflow {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| anyhow!("Failed to parse workflow YAML: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow from {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn request(&self) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(
            &self.workflow_id,
            self.steps.iter().map(|s| s.step.clone()).collect(),
        );
        request.workflow_name = self.workflow_name.clone();
        request.user_id = self.user_id.clone();
        request
    }

    /// Decision for the named step; `skip-step` when none is scripted.
    pub fn decision_for(&self, step_name: &str) -> ScriptedDecision {
        self.decisions.get(step_name).cloned().unwrap_or_default()
    }

    pub fn transport(&self) -> ScriptedTransport {
        let transport = ScriptedTransport::new();
        for step in &self.steps {
            transport.script(&step.step.tool_id, &step.step.operation_id, step.script.clone());
            if step.latency_ms > 0 {
                transport.set_latency(
                    &step.step.tool_id,
                    &step.step.operation_id,
                    Duration::from_millis(step.latency_ms),
                );
            }
        }
        transport
    }
}

/// A call the transport received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub tool_id: String,
    pub operation_id: String,
    pub payload: Value,
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<ScriptedOutcome>,
    last: Option<ScriptedOutcome>,
    latency: Duration,
}

/// [`ToolTransport`] that replays scripted outcomes.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<(String, String), Script>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append outcomes to the script for `(tool_id, operation_id)`.
    pub fn script(&self, tool_id: &str, operation_id: &str, outcomes: Vec<ScriptedOutcome>) {
        let mut scripts = self.scripts.lock();
        let script = scripts
            .entry((tool_id.to_string(), operation_id.to_string()))
            .or_default();
        script.outcomes.extend(outcomes);
    }

    pub fn set_latency(&self, tool_id: &str, operation_id: &str, latency: Duration) {
        self.scripts
            .lock()
            .entry((tool_id.to_string(), operation_id.to_string()))
            .or_default()
            .latency = latency;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, tool_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.tool_id == tool_id)
            .count()
    }

    fn next_outcome(&self, tool_id: &str, operation_id: &str) -> (Option<ScriptedOutcome>, Duration) {
        let mut scripts = self.scripts.lock();
        let Some(script) = scripts.get_mut(&(tool_id.to_string(), operation_id.to_string())) else {
            return (None, Duration::ZERO);
        };
        if let Some(outcome) = script.outcomes.pop_front() {
            script.last = Some(outcome);
        }
        (script.last.clone(), script.latency)
    }
}

#[async_trait]
impl ToolTransport for ScriptedTransport {
    async fn execute(
        &self,
        tool_id: &str,
        operation_id: &str,
        payload: Value,
    ) -> Result<Value, ToolError> {
        self.calls.lock().push(RecordedCall {
            tool_id: tool_id.to_string(),
            operation_id: operation_id.to_string(),
            payload,
        });
        let (outcome, latency) = self.next_outcome(tool_id, operation_id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        debug!(tool_id = %tool_id, operation_id = %operation_id, "Scripted call");
        match outcome {
            Some(ScriptedOutcome::Ok(value)) => Ok(value),
            Some(ScriptedOutcome::Error(error)) => Err(error),
            None => Ok(json!({ "tool_id": tool_id, "operation_id": operation_id })),
        }
    }
}
