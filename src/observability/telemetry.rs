//! Telemetry & Observability
//!
//! Structured logging for healing and execution:
//! - One-time `tracing-subscriber` initialisation (compact or JSON, to stderr)
//! - Log levels from `RUST_LOG`, `FLOWHEAL_LOG` or configuration
//! - Sanitising and secret redaction for tool-provided error text
//! - Spans for executions and healing sessions

use regex::Regex;
use std::sync::{Once, OnceLock};
use tracing::{info, info_span, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Sanitize a string for safe log output by escaping control characters.
/// Prevents log injection where a tool embeds newlines to forge log entries.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        vec![
            // API keys: sk-..., key-..., token-... followed by alphanumeric chars
            Regex::new(r"(?i)(sk-|key-|token-)[A-Za-z0-9_\-]{8,}").expect("invalid secret regex"),
            // Bearer tokens in Authorization headers
            Regex::new(r"(?i)Bearer\s+[A-Za-z0-9_\-\.]{8,}").expect("invalid bearer regex"),
            // OAuth artefacts echoed back by providers
            Regex::new(r"(?i)(access_token|refresh_token|client_secret)[=:]\s*[^\s&,]+")
                .expect("invalid oauth regex"),
            // Passwords in connection strings: password=..., passwd=..., pwd=...
            Regex::new(r"(?i)(password|passwd|pwd)\s*=\s*\S+").expect("invalid password regex"),
        ]
    })
}

/// Redact sensitive data patterns from a string before logging.
///
/// Matches API keys (`sk-`, `key-`, `token-` prefixed), Bearer tokens, OAuth
/// token parameters and passwords, replacing them with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }
    result
}

/// Pick the filter directive. `configured` already carries `FLOWHEAL_LOG`,
/// which wins over `RUST_LOG`.
pub fn log_filter<F>(configured: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if lookup("FLOWHEAL_LOG").is_some() {
        return configured.to_string();
    }
    lookup("RUST_LOG").unwrap_or_else(|| configured.to_string())
}

/// Initialize with a custom filter string. Only the first call has an effect.
pub fn init_tracing_with_filter(filter: &str, format: LogFormat) {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
        let registry = tracing_subscriber::registry().with(filter_layer);

        let _ = match format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_level(true)
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };
    });
}

/// Span covering one workflow execution.
pub fn execution_span(execution_id: &str, workflow_id: &str) -> Span {
    info_span!(
        "execution",
        execution_id = execution_id,
        workflow_id = workflow_id
    )
}

/// Span covering one healing session.
pub fn healing_span(session_id: &str, tool_id: &str, operation_id: &str) -> Span {
    let tool = sanitize_for_log(tool_id);
    info_span!(
        "healing",
        session_id = session_id,
        tool_id = tool.as_str(),
        operation_id = operation_id,
        resolved_by = tracing::field::Empty,
    )
}

/// Record an execution status change
pub fn record_state_transition(execution_id: &str, from: &str, to: &str) {
    info!(
        execution_id = execution_id,
        from = from,
        to = to,
        "Execution state transition"
    );
}

/// Initialize tracing for tests with a simple subscriber
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
