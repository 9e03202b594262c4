//! flowheal - self-healing execution for multi-tool workflows
//!
//! Keeps automated workflows running when the tools they call misbehave:
//!
//! - **Classification**: Every tool failure becomes a structured
//!   `ErrorClassification` (network, auth, rate limit, schema, server, ...)
//! - **Healing**: Retry with backoff, credential refresh, rate-limit waits,
//!   schema adaptation and rerouting, escalating to a human when exhausted
//! - **Circuit breakers**: Per-tool breakers stop hammering failing providers
//! - **Pattern learning**: Remembers which strategy fixed which failure
//! - **Execution control**: Runs workflows step by step with pause, resume,
//!   cancel and partial results
//!
//! # Quick Start
//!
//! ```ignore
//! use flowheal::{AutonomousExecutionController, Config, ExecutionRequest, WorkflowStep};
//!
//! let config = Config::load(None)?;
//! let engine = Arc::new(config.healing_engine());
//! let controller = AutonomousExecutionController::new(engine, transport, config.execution);
//! let started = controller.start_autonomous_execution(ExecutionRequest::new(
//!     "digest",
//!     vec![WorkflowStep::new("fetch", "github", "list_issues")],
//! ))?;
//! ```

use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

// ─── Core modules ──────────────────────────────────────────────────
pub mod clock;
pub mod config;
pub mod errors;

// ─── Healing & Execution ──────────────────────────────────────────
pub mod execution;
pub mod self_healing;
pub mod supervision;

// ─── Observability ────────────────────────────────────────────────
pub mod observability;

// ─── CLI & Simulation ─────────────────────────────────────────────
pub mod cli;
pub mod simulation;

pub use config::Config;
pub use errors::{FlowhealError, Result, ToolError};
pub use execution::{
    AutonomousExecutionController, AutonomousExecutionState, CriticalErrorDecision,
    ExecutionConfig, ExecutionRequest, ExecutionStatus, ToolTransport, WorkflowStep,
};
pub use self_healing::{
    ErrorClassification, ErrorClassifier, HealingConfig, HealingRequest, HealingResult,
    HealingStrategy, HealingStrategyEngine,
};
pub use supervision::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};

/// Process-wide shutdown signal shared by long-running commands.
pub fn shutdown_token() -> CancellationToken {
    static TOKEN: OnceLock<CancellationToken> = OnceLock::new();
    TOKEN.get_or_init(CancellationToken::new).clone()
}

pub fn request_shutdown() {
    shutdown_token().cancel();
}

pub fn is_shutdown_requested() -> bool {
    shutdown_token().is_cancelled()
}
