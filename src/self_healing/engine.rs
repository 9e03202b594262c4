//! Healing Strategy Engine
//!
//! Turns one failed tool call into a [`HealingResult`]:
//!
//! 1. Consult the pattern store; a trusted pattern picks the strategy.
//! 2. Otherwise classify the error and map it to a strategy.
//! 3. Run the strategy, up to `max_attempts_per_strategy` times, with backoff.
//!    Every invocation goes through the circuit breaker.
//! 4. A failure that classifies differently switches to its strategy if it
//!    has not been tried yet.
//! 5. With nothing left to try, reroute if an alternate connection exists,
//!    otherwise escalate.
//! 6. Reinforce or weaken the learned pattern at the terminal outcome.
//!
//! Nothing escapes as an error. Collaborator failures, operation errors and
//! timeouts are all folded into the result.

use super::{
    error_signature, AlternateConnection, CallContext, CredentialRefresher, ErrorClassification,
    ErrorClassifier, ErrorType, EscalationCoordinator, EscalationOutcome, HealingAttempt,
    HealingConfig, HealingResult, HealingStrategy, HealingUserOption, NoopCredentialRefresher,
    NoopRerouteProvider, NoopSchemaAdapter, PatternLearningStore, RerouteProvider, SchemaAdapter,
    SelfHealingSession, SessionStore, OPTION_RESUME_WITH_FIX,
};
use crate::clock::{elapsed_ms, Clock, JitterSource, RandomJitter, SystemClock};
use crate::errors::ToolError;
use crate::observability::metrics::{HealingMetricsSnapshot, HealingStats};
use crate::observability::telemetry::healing_span;
use crate::supervision::{CircuitBreakerRegistry, CircuitRejection};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

/// Future returned by a retry operation.
pub type OperationFuture = BoxFuture<'static, Result<Value, ToolError>>;

/// Re-invokes the failed operation. Called once per attempt.
pub type RetryOperation = Arc<dyn Fn(AttemptContext) -> OperationFuture + Send + Sync>;

/// What the operation needs to know about the attempt it is serving.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptContext {
    /// 1-based attempt number within the session
    pub attempt: u32,
    pub strategy: HealingStrategy,
    /// Set when rerouting to an alternate connection
    pub connection: Option<AlternateConnection>,
    /// Replacement payload from schema adaptation or a human fix
    pub payload_override: Option<Value>,
}

/// How to handle a session that ends in escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscalationMode {
    /// Ask the [`EscalationCoordinator`] and act on its answer.
    #[default]
    Await,
    /// Return the escalated result and let the caller decide.
    Defer,
}

pub struct HealingRequest {
    pub error: ToolError,
    pub context: CallContext,
    pub user_id: Option<String>,
    pub execution_id: Option<String>,
    pub retry_operation: RetryOperation,
    pub escalation: EscalationMode,
    pub cancel: CancellationToken,
}

impl HealingRequest {
    pub fn new(error: ToolError, context: CallContext, retry_operation: RetryOperation) -> Self {
        Self {
            error,
            context,
            user_id: None,
            execution_id: None,
            retry_operation,
            escalation: EscalationMode::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_execution(mut self, execution_id: &str) -> Self {
        self.execution_id = Some(execution_id.to_string());
        self
    }

    pub fn with_escalation_mode(mut self, mode: EscalationMode) -> Self {
        self.escalation = mode;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of one call made through the circuit breaker.
#[derive(Debug)]
pub enum CallOutcome {
    Completed(Result<Value, ToolError>),
    Rejected(CircuitRejection),
    /// The caller stopped waiting. The call itself may still finish.
    Cancelled,
}

/// Parse a human-supplied fix into a payload: JSON if it parses, else a string.
pub fn input_value_payload(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

enum StrategyOutcome {
    Resolved(Value),
    Failed,
    Cancelled,
}

enum Terminal {
    Resolved(HealingStrategy, Value),
    Escalate,
    Cancelled,
}

/// Mutable state of one session while strategies run.
struct Progress {
    attempts: Vec<HealingAttempt>,
    tried: BTreeSet<HealingStrategy>,
    last_class: ErrorClassification,
}

impl Progress {
    fn next_attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }
}

pub struct HealingStrategyEngine {
    config: HealingConfig,
    classifier: ErrorClassifier,
    breakers: CircuitBreakerRegistry,
    /// Set once a registry is supplied; `with_clock` then leaves it alone.
    custom_breakers: bool,
    patterns: Arc<PatternLearningStore>,
    escalation: Arc<EscalationCoordinator>,
    sessions: SessionStore,
    refresher: Arc<dyn CredentialRefresher>,
    adapter: Arc<dyn SchemaAdapter>,
    reroute: Arc<dyn RerouteProvider>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterSource>,
    stats: HealingStats,
}

impl HealingStrategyEngine {
    pub fn new(config: HealingConfig) -> Self {
        let sessions = SessionStore::new(config.result_history);
        Self {
            config,
            classifier: ErrorClassifier::new(),
            breakers: CircuitBreakerRegistry::default(),
            custom_breakers: false,
            patterns: Arc::new(PatternLearningStore::default()),
            escalation: Arc::new(EscalationCoordinator::default()),
            sessions,
            refresher: Arc::new(NoopCredentialRefresher),
            adapter: Arc::new(NoopSchemaAdapter),
            reroute: Arc::new(NoopRerouteProvider),
            clock: Arc::new(SystemClock),
            jitter: Arc::new(RandomJitter),
            stats: HealingStats::new(),
        }
    }

    pub fn with_circuit_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = breakers;
        self.custom_breakers = true;
        self
    }

    pub fn with_patterns(mut self, patterns: Arc<PatternLearningStore>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_escalation(mut self, escalation: Arc<EscalationCoordinator>) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    pub fn with_schema_adapter(mut self, adapter: Arc<dyn SchemaAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_reroute_provider(mut self, reroute: Arc<dyn RerouteProvider>) -> Self {
        self.reroute = reroute;
        self
    }

    /// Clock used for backoff sleeps and timestamps. The default breaker
    /// registry follows it; a registry passed to `with_circuit_breakers`
    /// keeps its own clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        if !self.custom_breakers {
            let config = *self.breakers.config();
            self.breakers = CircuitBreakerRegistry::with_clock(config, Arc::clone(&clock));
        }
        self.clock = clock;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &HealingConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn patterns(&self) -> &Arc<PatternLearningStore> {
        &self.patterns
    }

    pub fn escalation(&self) -> &Arc<EscalationCoordinator> {
        &self.escalation
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics_snapshot(&self) -> HealingMetricsSnapshot {
        self.stats.snapshot(
            self.breakers.trips(),
            self.patterns.patterns_learned(),
            self.patterns.match_rate(),
        )
    }

    /// Make one call through the breaker for `tool_id`, bounded by the
    /// attempt timeout.
    ///
    /// The operation runs on its own task and settles the breaker permit when
    /// it finishes, so a cancelled caller does not abandon the remote call
    /// halfway or lose its outcome.
    pub async fn call_through_breaker<F>(
        &self,
        tool_id: &str,
        make_call: F,
        cancel: &CancellationToken,
    ) -> CallOutcome
    where
        F: FnOnce() -> OperationFuture,
    {
        if cancel.is_cancelled() {
            return CallOutcome::Cancelled;
        }
        let permit = match self.breakers.try_acquire(tool_id) {
            Ok(permit) => permit,
            Err(rejection) => return CallOutcome::Rejected(rejection),
        };

        let timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        let call = make_call();
        let handle = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::timeout(format!(
                    "no response within {}ms",
                    timeout.as_millis()
                ))),
            };
            if result.is_ok() {
                permit.succeed();
            } else {
                permit.fail();
            }
            result
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => CallOutcome::Cancelled,
            joined = handle => match joined {
                Ok(result) => CallOutcome::Completed(result),
                Err(e) => CallOutcome::Completed(Err(ToolError::new(format!(
                    "operation task failed: {}",
                    e
                )))),
            },
        }
    }

    /// Recover from `request.error`. Always returns a result.
    pub async fn attempt_healing(&self, request: HealingRequest) -> HealingResult {
        let session_id = uuid::Uuid::new_v4().to_string();
        let span = healing_span(
            &session_id,
            &request.context.tool_id,
            &request.context.operation_id,
        );
        self.run_session(session_id, request).instrument(span).await
    }

    async fn run_session(&self, session_id: String, request: HealingRequest) -> HealingResult {
        let started = self.clock.now();
        let ctx = &request.context;
        self.sessions.open(
            SelfHealingSession::new(session_id.clone(), ctx, request.execution_id.clone(), started),
            request.cancel.clone(),
        );

        let signature = error_signature(&request.error);
        let original = self.classifier.classify(&request.error, ctx);
        let matched = self.patterns.lookup(&signature, &ctx.tool_id);

        let first = match &matched {
            Some(pattern) => {
                info!(
                    pattern_id = %pattern.id,
                    strategy = %pattern.strategy,
                    confidence = pattern.confidence_score,
                    "Learned pattern matched"
                );
                pattern.strategy
            }
            None => HealingStrategy::for_classification(&original),
        };
        info!(
            error_type = %original.error_type,
            strategy = %first,
            "Healing started"
        );

        let mut progress = Progress {
            attempts: Vec::new(),
            tried: BTreeSet::new(),
            last_class: original.clone(),
        };
        let mut strategy = first;
        let mut connection = None;

        let terminal = loop {
            if request.cancel.is_cancelled() {
                break Terminal::Cancelled;
            }
            if strategy == HealingStrategy::Escalate {
                break Terminal::Escalate;
            }

            progress.tried.insert(strategy);
            self.sessions.update(&session_id, self.clock.now(), |s| {
                s.current_strategy = Some(strategy);
            });

            if strategy == HealingStrategy::CircuitBreak {
                self.fail_fast(&mut progress);
            } else {
                match self
                    .run_strategy(strategy, &request, &session_id, &mut progress, connection.take())
                    .await
                {
                    StrategyOutcome::Resolved(value) => break Terminal::Resolved(strategy, value),
                    StrategyOutcome::Cancelled => break Terminal::Cancelled,
                    StrategyOutcome::Failed => {}
                }
            }

            let (next, alternate) = self.next_strategy(&request, &progress).await;
            debug!(from = %strategy, to = %next, "Switching strategy");
            strategy = next;
            connection = alternate;
        };

        let mut result = HealingResult {
            session_id: session_id.clone(),
            success: false,
            total_attempts: 0,
            total_duration_ms: 0,
            original_error: original.clone(),
            final_error: None,
            attempts: Vec::new(),
            resolved_by: None,
            escalated: false,
            escalation_reason: None,
            user_options: None,
            chosen_option: None,
            pattern_id: matched.as_ref().map(|p| p.id.clone()),
            confidence_score: matched.as_ref().map(|p| p.confidence_score),
            output: None,
        };

        match terminal {
            Terminal::Resolved(by, value) => {
                result.success = true;
                result.resolved_by = Some(by);
                result.output = Some(value);
                Span::current().record("resolved_by", by.as_str());
                self.reinforce(&signature, ctx, by, true, &mut result);
            }
            Terminal::Cancelled => {
                info!("Healing cancelled");
                result.final_error = Some(progress.last_class.clone());
            }
            Terminal::Escalate => {
                let reason = self.escalation_reason(ctx, &progress);
                let options = HealingUserOption::for_failure(&progress.last_class);
                warn!(
                    attempts = progress.attempts.len(),
                    reason = %reason,
                    "Healing escalated"
                );
                result.escalated = true;
                result.escalation_reason = Some(reason.clone());
                result.user_options = Some(options.clone());
                result.final_error = Some(progress.last_class.clone());

                if request.escalation == EscalationMode::Await {
                    let outcome = self
                        .await_decision(&session_id, &request, options, &reason)
                        .await;
                    result.chosen_option = Some(outcome.option_id.clone());
                    if outcome.option_id == OPTION_RESUME_WITH_FIX {
                        if let Some(value) = self
                            .resume_with_fix(&request, &session_id, &mut progress, &outcome)
                            .await
                        {
                            result.success = true;
                            result.resolved_by = Some(HealingStrategy::Escalate);
                            result.final_error = None;
                            result.output = Some(value);
                        } else {
                            result.final_error = Some(progress.last_class.clone());
                        }
                    }
                }

                if !result.success && first.invokes_operation() {
                    self.reinforce(&signature, ctx, first, false, &mut result);
                }
            }
        }

        let finished = self.clock.now();
        result.total_attempts = progress.attempts.len() as u32;
        result.total_duration_ms = elapsed_ms(started, finished);
        result.attempts = progress.attempts;

        info!(
            success = result.success,
            escalated = result.escalated,
            attempts = result.total_attempts,
            duration_ms = result.total_duration_ms,
            "Healing finished"
        );
        self.stats.record_result(&result, original.is_transient);
        self.sessions.finish(&session_id, result.clone(), finished);
        result
    }

    /// Run one strategy until it resolves, fails over to another
    /// classification, or runs out of attempts.
    async fn run_strategy(
        &self,
        strategy: HealingStrategy,
        request: &HealingRequest,
        session_id: &str,
        progress: &mut Progress,
        connection: Option<AlternateConnection>,
    ) -> StrategyOutcome {
        let max_attempts = if strategy == HealingStrategy::Reroute {
            1
        } else {
            self.config.max_attempts_per_strategy.max(1)
        };
        let target_tool = connection
            .as_ref()
            .map(|c| c.tool_id.clone())
            .unwrap_or_else(|| request.context.tool_id.clone());

        for n in 0..max_attempts {
            if progress.attempts.len() as u32 >= self.config.max_total_attempts {
                debug!(strategy = %strategy, "Global attempt limit reached");
                return StrategyOutcome::Failed;
            }

            let delay = self.delay_for(strategy, n, &progress.last_class);
            if !delay.is_zero() {
                debug!(
                    strategy = %strategy,
                    attempt = n + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before attempt"
                );
                if !self.sleep(delay, &request.cancel).await {
                    return StrategyOutcome::Cancelled;
                }
            }

            let started_at = self.clock.now();
            let attempt_number = progress.next_attempt_number();
            self.sessions.update(session_id, started_at, |s| {
                s.current_attempt = attempt_number;
            });

            let payload_override = match strategy {
                HealingStrategy::RefreshAuth => {
                    match self
                        .refresher
                        .refresh(&request.context.tool_id, request.user_id.as_deref())
                        .await
                    {
                        Ok(true) => None,
                        Ok(false) => {
                            self.record_unavailable(
                                progress,
                                strategy,
                                started_at,
                                delay,
                                "credential refresh declined",
                            );
                            return StrategyOutcome::Failed;
                        }
                        Err(e) => {
                            let note = format!("credential refresh failed: {}", e);
                            self.record_unavailable(progress, strategy, started_at, delay, &note);
                            return StrategyOutcome::Failed;
                        }
                    }
                }
                HealingStrategy::SchemaAdapt => {
                    match self.adapter.adapt(&request.context, &progress.last_class).await {
                        Ok(Some(payload)) => Some(payload),
                        Ok(None) => {
                            self.record_unavailable(
                                progress,
                                strategy,
                                started_at,
                                delay,
                                "no schema adaptation available",
                            );
                            return StrategyOutcome::Failed;
                        }
                        Err(e) => {
                            let note = format!("schema adaptation failed: {}", e);
                            self.record_unavailable(progress, strategy, started_at, delay, &note);
                            return StrategyOutcome::Failed;
                        }
                    }
                }
                _ => None,
            };

            let attempt = AttemptContext {
                attempt: attempt_number,
                strategy,
                connection: connection.clone(),
                payload_override,
            };
            let operation = Arc::clone(&request.retry_operation);
            let outcome = self
                .call_through_breaker(&target_tool, move || operation(attempt), &request.cancel)
                .await;
            let duration_ms = elapsed_ms(started_at, self.clock.now());

            let (error, note) = match outcome {
                CallOutcome::Cancelled => return StrategyOutcome::Cancelled,
                CallOutcome::Completed(Ok(value)) => {
                    debug!(strategy = %strategy, attempt = attempt_number, "Attempt succeeded");
                    self.stats.record_attempt(strategy, true);
                    progress.attempts.push(HealingAttempt {
                        attempt_number,
                        strategy,
                        started_at,
                        delay_ms: delay.as_millis() as u64,
                        duration_ms,
                        success: true,
                        error: None,
                        note: connection.as_ref().map(|c| format!("via {}", c.label)),
                    });
                    return StrategyOutcome::Resolved(value);
                }
                CallOutcome::Completed(Err(error)) => (error, None),
                CallOutcome::Rejected(rejection) => (
                    ToolError::circuit_open(&target_tool),
                    Some(rejection.to_string()),
                ),
            };

            let classification = self.classifier.classify(&error, &request.context);
            warn!(
                strategy = %strategy,
                attempt = attempt_number,
                error_type = %classification.error_type,
                "Attempt failed"
            );
            self.stats.record_attempt(strategy, false);
            progress.attempts.push(HealingAttempt {
                attempt_number,
                strategy,
                started_at,
                delay_ms: delay.as_millis() as u64,
                duration_ms,
                success: false,
                error: Some(classification.clone()),
                note,
            });
            let moved_on = HealingStrategy::for_classification(&classification) != strategy;
            progress.last_class = classification;
            if moved_on || strategy == HealingStrategy::Reroute {
                return StrategyOutcome::Failed;
            }
        }

        StrategyOutcome::Failed
    }

    /// Pick the next strategy after `progress.last_class`. Never returns a
    /// strategy that has already run, so sessions always terminate.
    async fn next_strategy(
        &self,
        request: &HealingRequest,
        progress: &Progress,
    ) -> (HealingStrategy, Option<AlternateConnection>) {
        let class = &progress.last_class;
        if progress.attempts.len() as u32 >= self.config.max_total_attempts {
            return (HealingStrategy::Escalate, None);
        }

        let candidate = HealingStrategy::for_classification(class);
        if candidate != HealingStrategy::Escalate && !progress.tried.contains(&candidate) {
            return (candidate, None);
        }
        if class.is_transient && class.is_retryable && !progress.tried.contains(&HealingStrategy::Retry)
        {
            return (HealingStrategy::Retry, None);
        }

        let reroutable = class.is_retryable || class.error_type == ErrorType::CircuitOpen;
        if reroutable && !progress.tried.contains(&HealingStrategy::Reroute) {
            match self.reroute.alternate(&request.context).await {
                Ok(Some(alternate)) => {
                    info!(connection_id = %alternate.connection_id, "Rerouting to alternate connection");
                    return (HealingStrategy::Reroute, Some(alternate));
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Reroute provider failed"),
            }
        }

        (HealingStrategy::Escalate, None)
    }

    fn delay_for(&self, strategy: HealingStrategy, n: u32, class: &ErrorClassification) -> Duration {
        let backoff = self.config.backoff();
        let jitter = self.jitter.as_ref();
        match strategy {
            HealingStrategy::RateLimitWait => class
                .retry_after_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| backoff.delay(n, jitter)),
            HealingStrategy::Retry => backoff.delay(n, jitter),
            HealingStrategy::RefreshAuth | HealingStrategy::SchemaAdapt | HealingStrategy::Reroute
                if n > 0 =>
            {
                backoff.delay(n - 1, jitter)
            }
            _ => Duration::ZERO,
        }
    }

    /// Returns false if cancelled before the delay elapsed.
    async fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.clock.sleep(delay) => true,
        }
    }

    fn fail_fast(&self, progress: &mut Progress) {
        warn!("Circuit open, failing fast");
        self.stats.record_attempt(HealingStrategy::CircuitBreak, false);
        progress.attempts.push(HealingAttempt {
            attempt_number: progress.next_attempt_number(),
            strategy: HealingStrategy::CircuitBreak,
            started_at: self.clock.now(),
            delay_ms: 0,
            duration_ms: 0,
            success: false,
            error: Some(progress.last_class.clone()),
            note: Some("circuit open, operation not invoked".to_string()),
        });
    }

    fn record_unavailable(
        &self,
        progress: &mut Progress,
        strategy: HealingStrategy,
        started_at: DateTime<Utc>,
        delay: Duration,
        note: &str,
    ) {
        debug!(strategy = %strategy, note = note, "Strategy unavailable");
        self.stats.record_attempt(strategy, false);
        progress.attempts.push(HealingAttempt {
            attempt_number: progress.next_attempt_number(),
            strategy,
            started_at,
            delay_ms: delay.as_millis() as u64,
            duration_ms: elapsed_ms(started_at, self.clock.now()),
            success: false,
            error: Some(progress.last_class.clone()),
            note: Some(note.to_string()),
        });
    }

    async fn await_decision(
        &self,
        session_id: &str,
        request: &HealingRequest,
        options: Vec<HealingUserOption>,
        reason: &str,
    ) -> EscalationOutcome {
        self.sessions.update(session_id, self.clock.now(), |s| {
            s.current_strategy = Some(HealingStrategy::Escalate);
            s.is_paused = false;
            s.is_active = true;
        });
        let Some(session) = self.sessions.get_session(session_id) else {
            return EscalationOutcome::abort_default(false);
        };
        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => EscalationOutcome::abort_default(false),
            outcome = self.escalation.escalate(session, options, reason) => outcome,
        }
    }

    /// Single extra invocation outside the attempt caps.
    async fn resume_with_fix(
        &self,
        request: &HealingRequest,
        session_id: &str,
        progress: &mut Progress,
        outcome: &EscalationOutcome,
    ) -> Option<Value> {
        let started_at = self.clock.now();
        let attempt_number = progress.next_attempt_number();
        self.sessions.update(session_id, started_at, |s| {
            s.current_attempt = attempt_number;
        });
        let attempt = AttemptContext {
            attempt: attempt_number,
            strategy: HealingStrategy::Escalate,
            connection: None,
            payload_override: outcome.input_value.as_deref().map(input_value_payload),
        };
        let operation = Arc::clone(&request.retry_operation);
        let call = self
            .call_through_breaker(
                &request.context.tool_id,
                move || operation(attempt),
                &request.cancel,
            )
            .await;

        let (value, error) = match call {
            CallOutcome::Completed(Ok(value)) => (Some(value), None),
            CallOutcome::Completed(Err(error)) => (None, Some(error)),
            CallOutcome::Rejected(_) => (None, Some(ToolError::circuit_open(&request.context.tool_id))),
            CallOutcome::Cancelled => return None,
        };
        let classification = error
            .as_ref()
            .map(|e| self.classifier.classify(e, &request.context));

        self.stats
            .record_attempt(HealingStrategy::Escalate, value.is_some());
        progress.attempts.push(HealingAttempt {
            attempt_number,
            strategy: HealingStrategy::Escalate,
            started_at,
            delay_ms: 0,
            duration_ms: elapsed_ms(started_at, self.clock.now()),
            success: value.is_some(),
            error: classification.clone(),
            note: Some(OPTION_RESUME_WITH_FIX.to_string()),
        });
        if let Some(classification) = classification {
            progress.last_class = classification;
        }
        value
    }

    fn reinforce(
        &self,
        signature: &str,
        ctx: &CallContext,
        strategy: HealingStrategy,
        success: bool,
        result: &mut HealingResult,
    ) {
        if !strategy.invokes_operation() {
            return;
        }
        if let Some(pattern) =
            self.patterns
                .record_outcome(signature, &ctx.tool_id, strategy, success, self.clock.now())
        {
            result.pattern_id = Some(pattern.id);
            result.confidence_score = Some(pattern.confidence_score);
        }
    }

    fn escalation_reason(&self, ctx: &CallContext, progress: &Progress) -> String {
        let class = &progress.last_class;
        if class.error_type == ErrorType::CircuitOpen {
            return format!("Circuit breaker for {} is open", ctx.tool_name);
        }
        if progress.attempts.len() as u32 >= self.config.max_total_attempts {
            return format!(
                "Attempt limit of {} reached: {}",
                self.config.max_total_attempts, class.user_message
            );
        }
        if !class.is_retryable {
            return format!("Error is not recoverable automatically: {}", class.user_message);
        }
        let tried: Vec<&str> = progress.tried.iter().map(|s| s.as_str()).collect();
        format!(
            "Recovery strategies exhausted ({}): {}",
            tried.join(", "),
            class.user_message
        )
    }
}
