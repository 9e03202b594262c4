use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The central error type for flowheal.
///
/// Expected tool failures never surface here: they are converted into a
/// `HealingResult` by the healing engine. This hierarchy covers programming
/// errors (bad configuration, invalid requests, illegal state transitions).
#[derive(Error, Debug)]
pub enum FlowhealError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid decision '{action_id}': {reason}")]
    InvalidDecision { action_id: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FlowhealError>;

/// Machine code attached to failures synthesized when a circuit breaker
/// rejects a call before the transport is contacted.
pub const CIRCUIT_OPEN_CODE: &str = "circuit_open";

/// A raw failure reported by the tool-invocation transport.
///
/// This is the sole input to error classification. Transports fill in
/// whatever they know: an HTTP status, a provider error code, a parsed
/// `Retry-After` header, or the fact that the call timed out.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", self.describe())]
pub struct ToolError {
    pub status: Option<u16>,
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub timed_out: bool,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            code: None,
            retry_after_ms: None,
            timed_out: false,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(message).with_code("network_error")
    }

    pub fn circuit_open(tool_id: &str) -> Self {
        Self::new(format!("Circuit breaker open for tool '{}'", tool_id))
            .with_code(CIRCUIT_OPEN_CODE)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn is_circuit_open(&self) -> bool {
        self.code.as_deref() == Some(CIRCUIT_OPEN_CODE)
    }

    fn describe(&self) -> String {
        match (self.status, self.timed_out) {
            (Some(status), _) => format!("HTTP {}: {}", status, self.message),
            (None, true) => format!("timed out: {}", self.message),
            (None, false) => self.message.clone(),
        }
    }
}

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_INVALID_REQUEST: u8 = 3;
pub const EXIT_EXECUTION_FAILED: u8 = 4;

/// Determine the appropriate process exit code for an error.
pub fn get_exit_code(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<FlowhealError>() {
        return match err {
            FlowhealError::Config(_) => EXIT_CONFIG_ERROR,
            FlowhealError::InvalidRequest(_) | FlowhealError::InvalidDecision { .. } => {
                EXIT_INVALID_REQUEST
            }
            _ => EXIT_ERROR,
        };
    }

    let msg = e.to_string().to_lowercase();
    if msg.contains("config") {
        return EXIT_CONFIG_ERROR;
    }

    EXIT_ERROR
}
