//! Autonomous Execution Controller
//!
//! Drives workflows step by step:
//!
//! ```text
//! running ──step ok──▶ running ──last step──▶ completed
//!    │                    ▲
//!    │ step fails         │ skip-step / fix succeeded
//!    ▼                    │
//! healing ──escalated──▶ paused ──abort / timeout──▶ failed
//!
//! any non-terminal ──cancel──▶ cancelled
//! ```
//!
//! Each execution runs on its own tokio task. Steps within an execution are
//! strictly sequential. All state lives behind a per-execution mutex, and
//! callers only ever receive clones.

use super::ledger::{ExecutionLog, ExecutionLogEntry, LogLevel};
use super::state::{
    AutonomousExecutionState, Cancellation, CriticalError, CriticalErrorDecision,
    ExecutionEvent, ExecutionEventKind, ExecutionPhase, ExecutionRequest, ExecutionStarted,
    ExecutionStatus, PartialResult, PartialStatus, WorkflowStep,
};
use super::{ExecutionConfig, ToolTransport};
use crate::clock::elapsed_ms;
use crate::errors::{FlowhealError, Result, ToolError};
use crate::observability::metrics::{ExecutionMetricsSnapshot, ExecutionStats};
use crate::observability::telemetry::{execution_span, record_state_transition, redact_secrets};
use crate::self_healing::engine::{input_value_payload, CallOutcome, OperationFuture};
use crate::self_healing::{
    AttemptContext, EscalationMode, HealingAttempt, HealingRequest, HealingResult,
    HealingStrategy, HealingStrategyEngine, HealingUserOption, RetryOperation, OPTION_ABORT,
    OPTION_RESUME_WITH_FIX, OPTION_SKIP_STEP,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Decided-by marker for decisions the controller makes itself.
const DECIDED_BY_TIMEOUT: &str = "system:timeout";

struct ExecutionHandle {
    execution_id: String,
    user_id: Option<String>,
    steps: Vec<WorkflowStep>,
    state: Mutex<AutonomousExecutionState>,
    cancel: CancellationToken,
    /// Responder for the decision the task is blocked on, if paused
    decision: Mutex<Option<oneshot::Sender<CriticalErrorDecision>>>,
    status: watch::Sender<ExecutionStatus>,
}

enum NextStep {
    Run(usize, WorkflowStep),
    Finished,
    Stop,
}

enum StepOutcome {
    Done(Value),
    Escalated(HealingResult),
    Cancelled,
}

struct ControllerInner {
    engine: Arc<HealingStrategyEngine>,
    transport: Arc<dyn ToolTransport>,
    config: ExecutionConfig,
    executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
    finished: Mutex<VecDeque<String>>,
    log: ExecutionLog,
    events: broadcast::Sender<ExecutionEvent>,
    stats: ExecutionStats,
}

/// Runs workflows and exposes their state.
#[derive(Clone)]
pub struct AutonomousExecutionController {
    inner: Arc<ControllerInner>,
}

#[derive(Serialize)]
struct ExecutionExport<'a> {
    state: &'a AutonomousExecutionState,
    log: Vec<ExecutionLogEntry>,
}

impl AutonomousExecutionController {
    pub fn new(
        engine: Arc<HealingStrategyEngine>,
        transport: Arc<dyn ToolTransport>,
        config: ExecutionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let log = ExecutionLog::new(config.log_capacity);
        Self {
            inner: Arc::new(ControllerInner {
                engine,
                transport,
                config,
                executions: RwLock::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                log,
                events,
                stats: ExecutionStats::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<HealingStrategyEngine> {
        &self.inner.engine
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.inner.config
    }

    /// Validate the request, register the execution and start stepping in
    /// the background. Returns before the first step runs.
    pub fn start_autonomous_execution(&self, request: ExecutionRequest) -> Result<ExecutionStarted> {
        request.validate()?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let now = self.inner.now();
        let state = AutonomousExecutionState::new(execution_id.clone(), &request, now);
        let (status, _) = watch::channel(ExecutionStatus::Running);
        let span = execution_span(&execution_id, &request.workflow_id);

        let handle = Arc::new(ExecutionHandle {
            execution_id: execution_id.clone(),
            user_id: request.user_id.clone(),
            steps: request.steps,
            state: Mutex::new(state.clone()),
            cancel: CancellationToken::new(),
            decision: Mutex::new(None),
            status,
        });
        self.inner
            .executions
            .write()
            .insert(execution_id.clone(), Arc::clone(&handle));
        self.inner.stats.record_started();

        info!(
            execution_id = %execution_id,
            workflow_id = %state.workflow_id,
            steps = state.total_steps,
            "Execution started"
        );
        self.inner.record(
            &execution_id,
            LogLevel::Info,
            "started",
            format!("Workflow {} started with {} steps", state.workflow_id, state.total_steps),
            None,
        );
        self.inner.emit(&state, ExecutionEventKind::Started);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(handle).await }.instrument(span));

        Ok(ExecutionStarted {
            execution_id,
            state,
        })
    }

    /// Stop an execution. In-flight calls finish on their own; their results
    /// are discarded.
    pub fn cancel_execution(
        &self,
        execution_id: &str,
        reason: &str,
        cancelled_by: &str,
        save_partial_results: bool,
    ) -> Result<AutonomousExecutionState> {
        let handle = self.inner.handle(execution_id)?;
        let snapshot = {
            let mut state = handle.state.lock();
            if state.status.is_terminal() {
                return Err(FlowhealError::InvalidStateTransition {
                    from: state.status.to_string(),
                    to: ExecutionStatus::Cancelled.to_string(),
                });
            }
            let now = self.inner.now();
            let index = state.current_step_index;
            let unfinished = matches!(
                state.phase,
                ExecutionPhase::ExecutingStep
                    | ExecutionPhase::Healing
                    | ExecutionPhase::AwaitingDecision
            );
            if unfinished && index < handle.steps.len() {
                state.partial_results.record(PartialResult {
                    step_index: index,
                    step_name: handle.steps[index].name.clone(),
                    status: PartialStatus::Partial,
                    artifacts: Vec::new(),
                    recorded_at: now,
                });
            }

            let from = state.status;
            state.status = ExecutionStatus::Cancelled;
            state.phase = ExecutionPhase::Done;
            state.completed_at = Some(now);
            state.cancellation = Some(Cancellation {
                reason: reason.to_string(),
                cancelled_by: cancelled_by.to_string(),
                cancelled_at: now,
            });
            if save_partial_results {
                state.final_results = Some(state.partial_results.snapshot());
            }
            handle.decision.lock().take();
            record_state_transition(execution_id, from.as_str(), state.status.as_str());
            state.clone()
        };

        handle.cancel.cancel();
        self.inner.record(
            execution_id,
            LogLevel::Warn,
            "cancelled",
            format!("Cancelled by {}: {}", cancelled_by, reason),
            Some(snapshot.current_step_index),
        );
        self.inner.finalize(&handle);
        Ok(snapshot)
    }

    /// Answer the critical error of a paused execution.
    pub fn resume_execution(
        &self,
        execution_id: &str,
        decision: CriticalErrorDecision,
    ) -> Result<AutonomousExecutionState> {
        let handle = self.inner.handle(execution_id)?;
        let mut state = handle.state.lock();

        if state.status != ExecutionStatus::Paused {
            return Err(FlowhealError::InvalidStateTransition {
                from: state.status.to_string(),
                to: ExecutionStatus::Running.to_string(),
            });
        }
        let allowed = state
            .critical_error
            .as_ref()
            .map(|c| c.allows(&decision.action_id))
            .unwrap_or(false);
        if !allowed {
            return Err(FlowhealError::InvalidDecision {
                action_id: decision.action_id.clone(),
                reason: "not one of the offered actions".to_string(),
            });
        }
        let Some(responder) = handle.decision.lock().take() else {
            return Err(FlowhealError::Internal(format!(
                "execution {} is paused but nothing is waiting for a decision",
                execution_id
            )));
        };

        self.inner.apply_decision(&handle, &mut state, &decision);
        if responder.send(decision).is_err() {
            warn!(execution_id = %execution_id, "Execution task stopped before the decision arrived");
        }
        Ok(state.clone())
    }

    pub fn get_execution_state(&self, execution_id: &str) -> Result<AutonomousExecutionState> {
        let handle = self.inner.handle(execution_id)?;
        let state = handle.state.lock().clone();
        Ok(state)
    }

    /// Every retained execution, oldest first.
    pub fn list_executions(&self) -> Vec<AutonomousExecutionState> {
        let mut all: Vec<_> = self
            .inner
            .executions
            .read()
            .values()
            .map(|h| h.state.lock().clone())
            .collect();
        all.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        all
    }

    pub fn execution_log(&self, execution_id: &str) -> Vec<ExecutionLogEntry> {
        self.inner.log.entries(execution_id)
    }

    /// State plus log as pretty JSON.
    pub fn export_execution(&self, execution_id: &str) -> Result<String> {
        let state = self.get_execution_state(execution_id)?;
        let export = ExecutionExport {
            state: &state,
            log: self.inner.log.entries(execution_id),
        };
        serde_json::to_string_pretty(&export)
            .map_err(|e| FlowhealError::Internal(format!("failed to export execution: {}", e)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn execution_metrics(&self) -> ExecutionMetricsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Wait until the execution reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<AutonomousExecutionState> {
        let handle = self.inner.handle(execution_id)?;
        let mut status = handle.status.subscribe();
        let wait = async {
            loop {
                if status.borrow_and_update().is_terminal() {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            FlowhealError::Internal(format!(
                "execution {} did not finish within {}ms",
                execution_id,
                timeout.as_millis()
            ))
        })?;
        let state = handle.state.lock().clone();
        Ok(state)
    }
}

impl ControllerInner {
    fn now(&self) -> DateTime<Utc> {
        self.engine.clock().now()
    }

    fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>> {
        self.executions
            .read()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| FlowhealError::ExecutionNotFound(execution_id.to_string()))
    }

    fn emit(&self, state: &AutonomousExecutionState, kind: ExecutionEventKind) {
        let critical_error = if kind == ExecutionEventKind::NeedsDecision {
            state.critical_error.clone()
        } else {
            None
        };
        // No subscribers is fine.
        let _ = self.events.send(ExecutionEvent {
            execution_id: state.execution_id.clone(),
            kind,
            status: state.status,
            step_index: state.current_step_index,
            progress: state.progress,
            critical_error,
            timestamp: self.now(),
        });
    }

    fn record(
        &self,
        execution_id: &str,
        level: LogLevel,
        event: &str,
        message: String,
        step_index: Option<usize>,
    ) {
        self.log
            .record(execution_id, level, event, message, step_index, self.now());
    }

    async fn run(self: Arc<Self>, handle: Arc<ExecutionHandle>) {
        loop {
            let (index, step) = match self.begin_step(&handle) {
                NextStep::Run(index, step) => (index, step),
                NextStep::Finished => {
                    self.finalize(&handle);
                    return;
                }
                NextStep::Stop => return,
            };

            let invocations = Arc::new(AtomicU32::new(0));
            let healing = match self.execute_step(&handle, index, &step, &invocations).await {
                StepOutcome::Done(output) => {
                    if !self.complete_step(&handle, index, &step, output, &invocations) {
                        return;
                    }
                    continue;
                }
                StepOutcome::Cancelled => return,
                StepOutcome::Escalated(healing) => healing,
            };

            if !self
                .resolve_escalation(&handle, index, &step, healing, &invocations)
                .await
            {
                return;
            }
        }
    }

    fn begin_step(&self, handle: &ExecutionHandle) -> NextStep {
        let mut state = handle.state.lock();
        if state.status != ExecutionStatus::Running {
            return NextStep::Stop;
        }

        let index = state.current_step_index;
        if index >= handle.steps.len() {
            let now = self.now();
            state.status = ExecutionStatus::Completed;
            state.phase = ExecutionPhase::Done;
            state.progress = 100.0;
            state.current_step_name = None;
            state.completed_at = Some(now);
            state.estimated_completion_at = Some(now);
            state.final_results = Some(state.partial_results.snapshot());
            record_state_transition(&handle.execution_id, "running", "completed");
            return NextStep::Finished;
        }

        let step = handle.steps[index].clone();
        state.phase = ExecutionPhase::ExecutingStep;
        state.current_step_name = Some(step.name.clone());
        debug!(step = index, name = %step.name, tool_id = %step.tool_id, "Step started");
        self.record(
            &handle.execution_id,
            LogLevel::Info,
            "step_started",
            format!("Running {} ({}/{})", step.name, step.tool_id, step.operation_id),
            Some(index),
        );
        self.emit(&state, ExecutionEventKind::StepStarted);
        NextStep::Run(index, step)
    }

    async fn execute_step(
        &self,
        handle: &ExecutionHandle,
        index: usize,
        step: &WorkflowStep,
        invocations: &Arc<AtomicU32>,
    ) -> StepOutcome {
        let first = self
            .engine
            .call_through_breaker(
                &step.tool_id,
                || step_call(&self.transport, step, &step.tool_id, step.payload.clone(), invocations),
                &handle.cancel,
            )
            .await;

        let error = match first {
            CallOutcome::Completed(Ok(output)) => return StepOutcome::Done(output),
            CallOutcome::Completed(Err(error)) => error,
            CallOutcome::Rejected(rejection) => {
                debug!(step = index, "{}", rejection);
                ToolError::circuit_open(&step.tool_id)
            }
            CallOutcome::Cancelled => return StepOutcome::Cancelled,
        };

        if !self.enter_healing(handle, index, &error) {
            return StepOutcome::Cancelled;
        }

        let transport = Arc::clone(&self.transport);
        let retry_step = step.clone();
        let counter = Arc::clone(invocations);
        let operation: RetryOperation = Arc::new(move |attempt: AttemptContext| {
            let tool_id = attempt
                .connection
                .as_ref()
                .map(|c| c.tool_id.clone())
                .unwrap_or_else(|| retry_step.tool_id.clone());
            let payload = attempt
                .payload_override
                .unwrap_or_else(|| retry_step.payload.clone());
            step_call(&transport, &retry_step, &tool_id, payload, &counter)
        });

        let mut request = HealingRequest::new(error, step.context(), operation)
            .with_execution(&handle.execution_id)
            .with_escalation_mode(EscalationMode::Defer)
            .with_cancel(handle.cancel.clone());
        if let Some(user_id) = &handle.user_id {
            request = request.with_user(user_id);
        }

        let healing = self.engine.attempt_healing(request).await;
        if handle.cancel.is_cancelled() {
            return StepOutcome::Cancelled;
        }
        if healing.success {
            StepOutcome::Done(healing.output.unwrap_or(Value::Null))
        } else {
            StepOutcome::Escalated(healing)
        }
    }

    fn enter_healing(&self, handle: &ExecutionHandle, index: usize, error: &ToolError) -> bool {
        let mut state = handle.state.lock();
        if state.status != ExecutionStatus::Running {
            return false;
        }
        state.phase = ExecutionPhase::Healing;
        warn!(step = index, error = %redact_secrets(&error.to_string()), "Step failed, healing");
        self.record(
            &handle.execution_id,
            LogLevel::Warn,
            "healing",
            format!("Step failed: {}", redact_secrets(&error.to_string())),
            Some(index),
        );
        self.emit(&state, ExecutionEventKind::Healing);
        true
    }

    /// Record a finished step. Returns false if the execution stopped while
    /// the step was running, in which case the output is discarded.
    fn complete_step(
        &self,
        handle: &ExecutionHandle,
        index: usize,
        step: &WorkflowStep,
        output: Value,
        invocations: &AtomicU32,
    ) -> bool {
        let mut state = handle.state.lock();
        if state.status != ExecutionStatus::Running || state.current_step_index != index {
            debug!(step = index, "Discarding result of abandoned step");
            return false;
        }

        let now = self.now();
        let calls = invocations.load(Ordering::SeqCst).max(1);
        let cost = step.cost * calls as f64;
        state.partial_results.record(PartialResult {
            step_index: index,
            step_name: step.name.clone(),
            status: PartialStatus::Completed,
            artifacts: vec![output],
            recorded_at: now,
        });
        state.current_cost += cost;
        state.critical_error = None;
        state.advance();

        let done = state.current_step_index;
        let remaining = state.total_steps.saturating_sub(done) as u64;
        let per_step_ms = elapsed_ms(state.started_at, now) / done.max(1) as u64;
        state.estimated_completion_at =
            Some(now + chrono::Duration::milliseconds((per_step_ms * remaining) as i64));

        self.stats.record_connection(cost);
        info!(step = index, calls = calls, progress = state.progress, "Step completed");
        self.record(
            &handle.execution_id,
            LogLevel::Info,
            "step_completed",
            format!("{} completed after {} call(s)", step.name, calls),
            Some(index),
        );
        self.emit(&state, ExecutionEventKind::StepCompleted);
        true
    }

    /// Pause on the escalated step until a decision moves the execution on.
    /// Returns true if stepping should continue.
    async fn resolve_escalation(
        &self,
        handle: &ExecutionHandle,
        index: usize,
        step: &WorkflowStep,
        mut healing: HealingResult,
        invocations: &Arc<AtomicU32>,
    ) -> bool {
        loop {
            let Some(responder) = self.pause(handle, index, step, healing.clone()) else {
                return false;
            };
            let Some(decision) = self.wait_for_decision(handle, responder).await else {
                return false;
            };

            match decision.action_id.as_str() {
                OPTION_SKIP_STEP => return true,
                OPTION_RESUME_WITH_FIX => {
                    let payload = decision
                        .input_value
                        .as_deref()
                        .map(input_value_payload)
                        .unwrap_or_else(|| step.payload.clone());
                    let call = self
                        .engine
                        .call_through_breaker(
                            &step.tool_id,
                            || step_call(&self.transport, step, &step.tool_id, payload, invocations),
                            &handle.cancel,
                        )
                        .await;
                    let error = match call {
                        CallOutcome::Completed(Ok(output)) => {
                            return self.complete_step(handle, index, step, output, invocations);
                        }
                        CallOutcome::Completed(Err(error)) => error,
                        CallOutcome::Rejected(_) => ToolError::circuit_open(&step.tool_id),
                        CallOutcome::Cancelled => return false,
                    };
                    info!(step = index, "Fix did not resolve the failure, pausing again");
                    healing = self.failed_fix(healing, step, &error);
                }
                _ => {
                    self.finalize(handle);
                    return false;
                }
            }
        }
    }

    fn pause(
        &self,
        handle: &ExecutionHandle,
        index: usize,
        step: &WorkflowStep,
        healing: HealingResult,
    ) -> Option<oneshot::Receiver<CriticalErrorDecision>> {
        let mut state = handle.state.lock();
        if state.status.is_terminal() {
            return None;
        }

        let possible_actions = healing.user_options.clone().unwrap_or_else(|| {
            HealingUserOption::for_failure(
                healing.final_error.as_ref().unwrap_or(&healing.original_error),
            )
        });
        let reason = healing
            .escalation_reason
            .clone()
            .unwrap_or_else(|| "automatic recovery failed".to_string());
        state.critical_error = Some(CriticalError {
            healing,
            step_index: index,
            step_name: step.name.clone(),
            possible_actions,
            raised_at: self.now(),
        });

        let from = state.status;
        state.status = ExecutionStatus::Paused;
        state.phase = ExecutionPhase::AwaitingDecision;
        let (tx, rx) = oneshot::channel();
        *handle.decision.lock() = Some(tx);

        record_state_transition(&handle.execution_id, from.as_str(), state.status.as_str());
        warn!(step = index, reason = %reason, "Execution paused for a decision");
        self.record(
            &handle.execution_id,
            LogLevel::Warn,
            "needs_decision",
            reason,
            Some(index),
        );
        self.emit(&state, ExecutionEventKind::NeedsDecision);
        handle.status.send_replace(state.status);
        Some(rx)
    }

    /// Block until a decision arrives, the execution is cancelled, or the
    /// decision timeout elapses (treated as `abort`).
    async fn wait_for_decision(
        &self,
        handle: &ExecutionHandle,
        mut responder: oneshot::Receiver<CriticalErrorDecision>,
    ) -> Option<CriticalErrorDecision> {
        let timeout = Duration::from_millis(self.config.decision_timeout_ms);
        let received = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => return None,
            received = tokio::time::timeout(timeout, &mut responder) => received,
        };
        if let Ok(Ok(decision)) = received {
            return Some(decision);
        }

        let mut state = handle.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        let pending = handle.decision.lock().take();
        if pending.is_none() {
            // A resume won the race; its decision is already applied and sent.
            drop(state);
            return responder.try_recv().ok();
        }

        warn!(
            timeout_ms = self.config.decision_timeout_ms,
            "No decision received, aborting execution"
        );
        let decision = CriticalErrorDecision {
            action_id: OPTION_ABORT.to_string(),
            input_value: None,
            decided_by: DECIDED_BY_TIMEOUT.to_string(),
            decided_at: self.now(),
        };
        self.apply_decision(handle, &mut state, &decision);
        Some(decision)
    }

    /// State transition for a decision. Runs under the state lock, before the
    /// execution task is woken.
    fn apply_decision(
        &self,
        handle: &ExecutionHandle,
        state: &mut AutonomousExecutionState,
        decision: &CriticalErrorDecision,
    ) {
        let now = self.now();
        let from = state.status;
        let index = state.current_step_index;
        state.last_decision = Some(decision.clone());

        let kind = match decision.action_id.as_str() {
            OPTION_SKIP_STEP => {
                let step_name = handle
                    .steps
                    .get(index)
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                state.partial_results.record(PartialResult {
                    step_index: index,
                    step_name,
                    status: PartialStatus::Skipped,
                    artifacts: Vec::new(),
                    recorded_at: now,
                });
                state.critical_error = None;
                state.status = ExecutionStatus::Running;
                state.advance();
                Some(ExecutionEventKind::StepSkipped)
            }
            OPTION_RESUME_WITH_FIX => {
                state.critical_error = None;
                state.status = ExecutionStatus::Running;
                state.phase = ExecutionPhase::ExecutingStep;
                Some(ExecutionEventKind::Resumed)
            }
            _ => {
                state.status = ExecutionStatus::Failed;
                state.phase = ExecutionPhase::Done;
                state.completed_at = Some(now);
                state.final_results = Some(state.partial_results.snapshot());
                None
            }
        };

        record_state_transition(&handle.execution_id, from.as_str(), state.status.as_str());
        self.record(
            &handle.execution_id,
            LogLevel::Info,
            "decision",
            format!("{} chose {}", decision.decided_by, decision.action_id),
            Some(index),
        );
        // Terminal statuses are published by `finalize`.
        if let Some(kind) = kind {
            self.emit(state, kind);
            handle.status.send_replace(state.status);
        }
    }

    /// Fold a failed fix attempt into the healing result for the next pause.
    fn failed_fix(
        &self,
        mut healing: HealingResult,
        step: &WorkflowStep,
        error: &ToolError,
    ) -> HealingResult {
        let classification = self.engine.classifier().classify(error, &step.context());
        let now = self.now();
        healing.attempts.push(HealingAttempt {
            attempt_number: healing.total_attempts + 1,
            strategy: HealingStrategy::Escalate,
            started_at: now,
            delay_ms: 0,
            duration_ms: 0,
            success: false,
            error: Some(classification.clone()),
            note: Some(OPTION_RESUME_WITH_FIX.to_string()),
        });
        healing.total_attempts += 1;
        healing.chosen_option = Some(OPTION_RESUME_WITH_FIX.to_string());
        healing.escalation_reason = Some(format!(
            "The fix did not resolve the failure: {}",
            classification.user_message
        ));
        healing.user_options = Some(HealingUserOption::for_failure(&classification));
        healing.final_error = Some(classification);
        healing
    }

    /// Bookkeeping once an execution is terminal.
    fn finalize(&self, handle: &ExecutionHandle) {
        let state = handle.state.lock().clone();
        let kind = match state.status {
            ExecutionStatus::Completed => {
                self.stats.record_completed();
                ExecutionEventKind::Completed
            }
            ExecutionStatus::Failed => {
                self.stats.record_failed();
                ExecutionEventKind::Failed
            }
            ExecutionStatus::Cancelled => {
                self.stats.record_cancelled();
                ExecutionEventKind::Cancelled
            }
            ExecutionStatus::Running | ExecutionStatus::Paused => return,
        };

        info!(
            execution_id = %state.execution_id,
            status = %state.status,
            cost = state.current_cost,
            "Execution finished"
        );
        self.record(
            &state.execution_id,
            LogLevel::Info,
            state.status.as_str(),
            format!(
                "Finished {} with {} step result(s)",
                state.status,
                state.partial_results.len()
            ),
            None,
        );
        self.emit(&state, kind);
        self.retain(&state.execution_id);
        handle.status.send_replace(state.status);
    }

    /// Evict the oldest terminal executions beyond the retention limit.
    fn retain(&self, execution_id: &str) {
        let mut finished = self.finished.lock();
        finished.push_back(execution_id.to_string());
        while finished.len() > self.config.retain_terminal {
            if let Some(evicted) = finished.pop_front() {
                self.executions.write().remove(&evicted);
                self.log.remove(&evicted);
                debug!(execution_id = %evicted, "Evicted finished execution");
            }
        }
    }
}

fn step_call(
    transport: &Arc<dyn ToolTransport>,
    step: &WorkflowStep,
    tool_id: &str,
    payload: Value,
    invocations: &Arc<AtomicU32>,
) -> OperationFuture {
    let transport = Arc::clone(transport);
    let tool_id = tool_id.to_string();
    let operation_id = step.operation_id.clone();
    let counter = Arc::clone(invocations);
    Box::pin(async move {
        counter.fetch_add(1, Ordering::SeqCst);
        transport.execute(&tool_id, &operation_id, payload).await
    })
}
