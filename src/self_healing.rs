//! Self-Healing System
//!
//! This module turns tool failures into recovery decisions:
//! - Error classification (what kind of failure is this?)
//! - Pattern learning (what fixed this last time?)
//! - Strategy execution with backoff (retry, refresh auth, wait out rate limits, ...)
//! - Escalation to a human when automatic recovery is exhausted
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Healing Strategy Engine                      │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐   │
//! │  │ Error         │  │ Pattern       │  │ Escalation    │   │
//! │  │ Classifier    │  │ Store         │  │ Coordinator   │   │
//! │  └───────────────┘  └───────────────┘  └───────────────┘   │
//! │           │                  │                  │           │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐   │
//! │  │ Circuit       │  │ Backoff       │  │ Session       │   │
//! │  │ Breakers      │  │ Policy        │  │ Table         │   │
//! │  └───────────────┘  └───────────────┘  └───────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::supervision::BackoffPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod classifier;
pub mod collaborators;
pub mod engine;
pub mod escalation;
pub mod patterns;
pub mod session;

pub use classifier::{error_signature, ErrorClassifier};
pub use collaborators::{
    AlternateConnection, CredentialRefresher, NoopCredentialRefresher, NoopRerouteProvider,
    NoopSchemaAdapter, RerouteProvider, SchemaAdapter,
};
pub use engine::{
    input_value_payload, AttemptContext, CallOutcome, EscalationMode, HealingRequest,
    HealingStrategyEngine, OperationFuture, RetryOperation,
};
pub use escalation::{EscalationCoordinator, EscalationOutcome, EscalationRequest};
pub use patterns::{ErrorPattern, PatternConfig, PatternLearningStore};
pub use session::{SelfHealingSession, SessionStore};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the healing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Attempts allowed per strategy before moving on
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_strategy: u32,
    /// Attempts allowed across all strategies for one session
    #[serde(default = "default_max_total_attempts")]
    pub max_total_attempts: u32,
    /// Base delay for exponential backoff (ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay for exponential backoff (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter applied to backoff delays, as a fraction of the delay
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Wall-clock budget for a single attempt (ms)
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Finished healing results kept for inspection
    #[serde(default = "default_result_history")]
    pub result_history: usize,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_max_total_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter_fraction() -> f64 {
    0.2
}
fn default_attempt_timeout_ms() -> u64 {
    30_000
}
fn default_result_history() -> usize {
    100
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_strategy: default_max_attempts(),
            max_total_attempts: default_max_total_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            result_history: default_result_history(),
        }
    }
}

impl HealingConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter_fraction: self.jitter_fraction,
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Identity of the call that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub tool_id: String,
    pub tool_name: String,
    pub operation_id: String,
    pub operation_type: String,
}

impl CallContext {
    pub fn new(tool_id: &str, operation_id: &str) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            tool_name: tool_id.to_string(),
            operation_id: operation_id.to_string(),
            operation_type: "action".to_string(),
        }
    }

    pub fn with_tool_name(mut self, name: &str) -> Self {
        self.tool_name = name.to_string();
        self
    }

    pub fn with_operation_type(mut self, operation_type: &str) -> Self {
        self.operation_type = operation_type.to_string();
        self
    }
}

/// Broad failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Connectivity problems and timeouts
    Network,
    /// Expired or rejected credentials
    Auth,
    /// Provider throttling
    RateLimit,
    /// Payload does not match what the tool expects
    Schema,
    /// Provider-side 5xx
    Server,
    /// Call short-circuited by an open breaker
    CircuitOpen,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Network => "network",
            ErrorType::Auth => "auth",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Schema => "schema",
            ErrorType::Server => "server",
            ErrorType::CircuitOpen => "circuit_open",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the classifier thinks should happen next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Retry,
    Abort,
    Escalate,
}

/// Structured view of a single failure. Produced fresh per failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub error_type: ErrorType,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub suggested_action: SuggestedAction,
    pub user_message: String,
    pub technical_message: String,
    pub retry_after_ms: Option<u64>,
}

// ============================================================================
// Strategies
// ============================================================================

/// Recovery tactic, ordered by typical cost/invasiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStrategy {
    Retry,
    RefreshAuth,
    RateLimitWait,
    SchemaAdapt,
    CircuitBreak,
    Reroute,
    Escalate,
}

impl HealingStrategy {
    pub const ALL: [HealingStrategy; 7] = [
        HealingStrategy::Retry,
        HealingStrategy::RefreshAuth,
        HealingStrategy::RateLimitWait,
        HealingStrategy::SchemaAdapt,
        HealingStrategy::CircuitBreak,
        HealingStrategy::Reroute,
        HealingStrategy::Escalate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealingStrategy::Retry => "retry",
            HealingStrategy::RefreshAuth => "refresh_auth",
            HealingStrategy::RateLimitWait => "rate_limit_wait",
            HealingStrategy::SchemaAdapt => "schema_adapt",
            HealingStrategy::CircuitBreak => "circuit_break",
            HealingStrategy::Reroute => "reroute",
            HealingStrategy::Escalate => "escalate",
        }
    }

    /// Strategies that end by invoking the operation again.
    pub fn invokes_operation(&self) -> bool {
        !matches!(
            self,
            HealingStrategy::CircuitBreak | HealingStrategy::Escalate
        )
    }

    /// Map a classification onto the strategy that addresses it.
    pub fn for_classification(classification: &ErrorClassification) -> Self {
        match classification.error_type {
            ErrorType::CircuitOpen => HealingStrategy::CircuitBreak,
            ErrorType::RateLimit => HealingStrategy::RateLimitWait,
            ErrorType::Auth => HealingStrategy::RefreshAuth,
            ErrorType::Schema => HealingStrategy::SchemaAdapt,
            ErrorType::Network | ErrorType::Server
                if classification.is_transient && classification.is_retryable =>
            {
                HealingStrategy::Retry
            }
            _ => HealingStrategy::Escalate,
        }
    }
}

impl std::fmt::Display for HealingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HealingStrategy::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| format!("unknown healing strategy: {}", s))
    }
}

// ============================================================================
// Results
// ============================================================================

/// One attempt made while healing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAttempt {
    pub attempt_number: u32,
    pub strategy: HealingStrategy,
    pub started_at: DateTime<Utc>,
    /// Backoff waited before this attempt
    pub delay_ms: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<ErrorClassification>,
    pub note: Option<String>,
}

pub const OPTION_RESUME_WITH_FIX: &str = "resume-with-fix";
pub const OPTION_SKIP_STEP: &str = "skip-step";
pub const OPTION_ABORT: &str = "abort";

/// A choice offered to the human when healing escalates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealingUserOption {
    pub id: String,
    pub label: String,
    pub description: String,
    pub requires_input: bool,
}

impl HealingUserOption {
    pub fn resume_with_fix(hint: &str) -> Self {
        Self {
            id: OPTION_RESUME_WITH_FIX.to_string(),
            label: "Fix and resume".to_string(),
            description: hint.to_string(),
            requires_input: true,
        }
    }

    pub fn skip_step() -> Self {
        Self {
            id: OPTION_SKIP_STEP.to_string(),
            label: "Skip this step".to_string(),
            description: "Mark the step as skipped and continue with the rest of the workflow"
                .to_string(),
            requires_input: false,
        }
    }

    pub fn abort() -> Self {
        Self {
            id: OPTION_ABORT.to_string(),
            label: "Stop the workflow".to_string(),
            description: "Stop here and keep the results produced so far".to_string(),
            requires_input: false,
        }
    }

    /// Options for an unresolved failure, with a fix hint tailored to it.
    pub fn for_failure(classification: &ErrorClassification) -> Vec<Self> {
        let hint = match classification.error_type {
            ErrorType::Auth => "Reconnect the account, then retry the step",
            ErrorType::Schema => "Correct the field mapping or supply the missing value",
            ErrorType::RateLimit => "Wait for the quota to reset, then retry the step",
            ErrorType::CircuitOpen | ErrorType::Server | ErrorType::Network => {
                "Retry once the service is reachable again"
            }
            ErrorType::Unknown => "Provide corrected input and retry the step",
        };
        vec![Self::resume_with_fix(hint), Self::skip_step(), Self::abort()]
    }
}

/// Terminal record of a healing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingResult {
    pub session_id: String,
    pub success: bool,
    pub total_attempts: u32,
    pub total_duration_ms: u64,
    pub original_error: ErrorClassification,
    pub final_error: Option<ErrorClassification>,
    pub attempts: Vec<HealingAttempt>,
    pub resolved_by: Option<HealingStrategy>,
    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub user_options: Option<Vec<HealingUserOption>>,
    /// Option picked by the escalation consumer, if it was consulted
    pub chosen_option: Option<String>,
    pub pattern_id: Option<String>,
    pub confidence_score: Option<f64>,
    /// Output of the operation when healing succeeded
    pub output: Option<serde_json::Value>,
}
