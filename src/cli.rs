//! flowheal command line
//!
//! - `classify`: show how a tool failure would be classified and healed
//! - `run`: drive a scripted workflow through the execution controller
//! - `config`: print the effective configuration

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::errors::{ToolError, EXIT_EXECUTION_FAILED, EXIT_SUCCESS};
use crate::execution::{
    AutonomousExecutionController, AutonomousExecutionState, CriticalErrorDecision,
    ExecutionEvent, ExecutionEventKind, ExecutionStatus, PartialStatus,
};
use crate::observability::metrics::MetricsAggregator;
use crate::observability::telemetry::{init_tracing_with_filter, log_filter};
use crate::self_healing::{CallContext, HealingStrategy, OPTION_ABORT};
use crate::simulation::ScriptedWorkflow;

const DECIDED_BY_CLI: &str = "cli";

#[derive(Parser)]
#[command(name = "flowheal")]
#[command(about = "Self-healing execution for multi-tool workflows")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Verbose logging (overrides the configured level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a tool failure and show the strategy that would handle it
    #[command(alias = "c")]
    Classify {
        /// Error message returned by the tool
        message: String,
        /// HTTP status
        #[arg(short, long)]
        status: Option<u16>,
        /// Provider error code
        #[arg(long)]
        code: Option<String>,
        /// Retry-After hint in milliseconds
        #[arg(long)]
        retry_after_ms: Option<u64>,
        /// The call timed out
        #[arg(long)]
        timed_out: bool,
        #[arg(long, default_value = "tool")]
        tool: String,
        #[arg(long, default_value = "operation")]
        operation: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run a scripted workflow file
    #[command(alias = "r")]
    Run {
        /// Workflow YAML file
        workflow: PathBuf,
        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
        /// Give up waiting for the execution after this many seconds
        #[arg(long, default_value = "600")]
        timeout_secs: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Parse arguments and run. Returns the process exit code.
pub async fn run() -> Result<u8> {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }

    let config = Config::load(cli.config.as_deref())?;
    let level = if cli.verbose {
        "flowheal=debug".to_string()
    } else {
        log_filter(&config.logging.level, |key| std::env::var(key).ok())
    };
    init_tracing_with_filter(&level, config.logging.format);

    match cli.command {
        Commands::Classify {
            message,
            status,
            code,
            retry_after_ms,
            timed_out,
            tool,
            operation,
            json,
        } => {
            let mut error = ToolError::new(message);
            error.status = status;
            error.code = code;
            error.retry_after_ms = retry_after_ms;
            error.timed_out = timed_out;
            classify(&config, error, &CallContext::new(&tool, &operation), json)
        }
        Commands::Run {
            workflow,
            json,
            timeout_secs,
        } => {
            let workflow = ScriptedWorkflow::load(&workflow)?;
            run_workflow(&config, workflow, json, Duration::from_secs(timeout_secs)).await
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(EXIT_SUCCESS)
        }
    }
}

fn classify(config: &Config, error: ToolError, ctx: &CallContext, json: bool) -> Result<u8> {
    let engine = config.healing_engine();
    let classification = engine.classifier().classify(&error, ctx);
    let strategy = HealingStrategy::for_classification(&classification);

    if json {
        let out = serde_json::json!({
            "classification": classification,
            "strategy": strategy,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("{} {}", "Error type:".bold(), classification.error_type.to_string().cyan());
    println!("{} {}", "Transient:".bold(), classification.is_transient);
    println!("{} {}", "Retryable:".bold(), classification.is_retryable);
    if let Some(ms) = classification.retry_after_ms {
        println!("{} {}ms", "Retry after:".bold(), ms);
    }
    println!("{} {}", "Strategy:".bold(), strategy.to_string().green());
    println!("{} {}", "Message:".bold(), classification.user_message);
    println!("{}", classification.technical_message.dimmed());
    Ok(EXIT_SUCCESS)
}

async fn run_workflow(
    config: &Config,
    workflow: ScriptedWorkflow,
    json: bool,
    timeout: Duration,
) -> Result<u8> {
    let engine = Arc::new(config.healing_engine());
    let transport = Arc::new(workflow.transport());
    let controller =
        AutonomousExecutionController::new(Arc::clone(&engine), transport, config.execution.clone());
    let metrics = MetricsAggregator::new(engine).with_controller(controller.clone());

    let mut events = controller.subscribe();
    let started = controller.start_autonomous_execution(workflow.request())?;
    let execution_id = started.execution_id.clone();
    if !json {
        println!(
            "{} {} ({} steps)",
            "Running".bold(),
            workflow.workflow_id.cyan(),
            started.state.total_steps
        );
    }

    let shutdown = crate::shutdown_token();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                cancel_quietly(&controller, &execution_id, "interrupted");
                break;
            }
            _ = &mut deadline => {
                cancel_quietly(&controller, &execution_id, "timed out");
                break;
            }
            received = events.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        if event.execution_id != execution_id {
            continue;
        }
        if !json {
            print_event(&event);
        }

        match event.kind {
            ExecutionEventKind::NeedsDecision => {
                answer_escalation(&controller, &workflow, &event)?;
            }
            ExecutionEventKind::Completed
            | ExecutionEventKind::Failed
            | ExecutionEventKind::Cancelled => break,
            _ => {}
        }
    }

    let state = controller
        .wait_for_terminal(&execution_id, Duration::from_secs(5))
        .await?;
    if json {
        let out = serde_json::json!({
            "state": state,
            "metrics": metrics.snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_summary(&state);
    }

    Ok(match state.status {
        ExecutionStatus::Completed => EXIT_SUCCESS,
        _ => EXIT_EXECUTION_FAILED,
    })
}

/// Cancel, keeping partial results. The execution may already be finished.
fn cancel_quietly(controller: &AutonomousExecutionController, execution_id: &str, reason: &str) {
    if let Err(e) = controller.cancel_execution(execution_id, reason, DECIDED_BY_CLI, true) {
        tracing::debug!(error = %e, "Cancel skipped");
    }
}

fn answer_escalation(
    controller: &AutonomousExecutionController,
    workflow: &ScriptedWorkflow,
    event: &ExecutionEvent,
) -> Result<()> {
    let critical = event
        .critical_error
        .as_ref()
        .ok_or_else(|| anyhow!("decision requested without a critical error"))?;
    let scripted = workflow.decision_for(&critical.step_name);
    let action = if critical.allows(&scripted.action) {
        scripted.action
    } else {
        OPTION_ABORT.to_string()
    };

    let mut decision = CriticalErrorDecision::new(&action, DECIDED_BY_CLI);
    if let Some(input) = scripted.input.as_deref() {
        decision = decision.with_input(input);
    }
    match controller.resume_execution(&event.execution_id, decision) {
        Ok(_) => Ok(()),
        // The decision timeout may have fired first.
        Err(crate::errors::FlowhealError::InvalidStateTransition { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn print_event(event: &ExecutionEvent) {
    let step = event.step_index + 1;
    match event.kind {
        ExecutionEventKind::StepStarted => {
            println!("  {} step {}", "→".blue(), step);
        }
        ExecutionEventKind::StepCompleted => {
            println!("  {} step done ({:.0}%)", "✓".green(), event.progress);
        }
        ExecutionEventKind::Healing => {
            println!("  {} step {} failed, healing", "↻".yellow(), step);
        }
        ExecutionEventKind::NeedsDecision => {
            if let Some(critical) = &event.critical_error {
                println!(
                    "  {} {}: {}",
                    "!".red().bold(),
                    critical.step_name,
                    critical
                        .healing
                        .escalation_reason
                        .as_deref()
                        .unwrap_or("needs a decision")
                );
            }
        }
        ExecutionEventKind::StepSkipped => {
            println!("  {} step skipped", "↷".yellow());
        }
        ExecutionEventKind::Resumed => {
            println!("  {} resuming with fix", "↻".yellow());
        }
        _ => {}
    }
}

fn print_summary(state: &AutonomousExecutionState) {
    let status = match state.status {
        ExecutionStatus::Completed => state.status.to_string().green().bold(),
        ExecutionStatus::Cancelled => state.status.to_string().yellow().bold(),
        _ => state.status.to_string().red().bold(),
    };
    println!();
    println!("{} {}", "Status:".bold(), status);
    println!(
        "{} {} completed, {} skipped, {} partial",
        "Steps:".bold(),
        state.partial_results.count(PartialStatus::Completed),
        state.partial_results.count(PartialStatus::Skipped),
        state.partial_results.count(PartialStatus::Partial)
    );
    println!(
        "{} {:.4} (estimated {:.4})",
        "Cost:".bold(),
        state.current_cost,
        state.estimated_total_cost
    );
    if let Some(cancellation) = &state.cancellation {
        println!("{} {}", "Cancelled:".bold(), cancellation.reason);
    }
}
