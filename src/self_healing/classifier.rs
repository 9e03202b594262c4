//! Error classification.
//!
//! Pure functions, no I/O: identical input always yields an identical
//! classification, which is what pattern learning keys on.

use super::{CallContext, ErrorClassification, ErrorType, SuggestedAction};
use crate::errors::ToolError;
use crate::observability::telemetry::redact_secrets;
use regex::{Regex, RegexSet};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

static AUTH_PATTERNS: OnceLock<RegexSet> = OnceLock::new();
static RATE_LIMIT_PATTERNS: OnceLock<RegexSet> = OnceLock::new();
static NETWORK_PATTERNS: OnceLock<RegexSet> = OnceLock::new();
static SCHEMA_PATTERNS: OnceLock<RegexSet> = OnceLock::new();
static VOLATILE_TOKENS: OnceLock<Vec<Regex>> = OnceLock::new();

fn auth_patterns() -> &'static RegexSet {
    AUTH_PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"(?i)token\s+(has\s+)?expired",
            r"(?i)expired\s+token",
            r"(?i)invalid[_\s]grant",
            r"(?i)invalid[_\s]token",
            r"(?i)unauthori[sz]ed",
            r"(?i)forbidden",
            r"(?i)access\s+denied",
            r"(?i)authentication\s+(failed|required)",
        ])
        .expect("invalid auth patterns")
    })
}

fn rate_limit_patterns() -> &'static RegexSet {
    RATE_LIMIT_PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"(?i)rate[\s_-]?limit",
            r"(?i)too\s+many\s+requests",
            r"(?i)quota\s+exceeded",
            r"(?i)throttl",
        ])
        .expect("invalid rate limit patterns")
    })
}

fn network_patterns() -> &'static RegexSet {
    NETWORK_PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"(?i)timed?\s*out",
            r"(?i)timeout",
            r"(?i)connection\s+(refused|reset|closed|aborted)",
            r"(?i)econn(reset|refused|aborted)",
            r"(?i)etimedout",
            r"(?i)network\s+(error|unreachable)",
            r"(?i)dns|enotfound|getaddrinfo",
            r"(?i)socket\s+hang\s+up",
        ])
        .expect("invalid network patterns")
    })
}

fn schema_patterns() -> &'static RegexSet {
    SCHEMA_PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"(?i)schema",
            r"(?i)validation",
            r"(?i)invalid\s+(field|payload|parameter|argument|input)",
            r"(?i)(missing|required)\s+(field|property|parameter)",
            r"(?i)unexpected\s+(field|property|type)",
            r"(?i)type\s+mismatch",
        ])
        .expect("invalid schema patterns")
    })
}

fn volatile_tokens() -> &'static Vec<Regex> {
    VOLATILE_TOKENS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
                .expect("invalid uuid regex"),
            Regex::new(r"(?i)\b[0-9a-f]{16,}\b").expect("invalid hex regex"),
            Regex::new(r"\d+").expect("invalid digit regex"),
            Regex::new(r"\s+").expect("invalid whitespace regex"),
        ]
    })
}

/// Maps raw tool failures to [`ErrorClassification`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure. Checks run in priority order: breaker rejection,
    /// auth, rate limit, connectivity, 5xx, schema, then unknown.
    pub fn classify(&self, error: &ToolError, ctx: &CallContext) -> ErrorClassification {
        let message = error.message.as_str();
        let code = error.code.as_deref().unwrap_or("");
        let status = error.status;
        let technical = technical_message(error, ctx);

        if error.is_circuit_open() {
            return ErrorClassification {
                error_type: ErrorType::CircuitOpen,
                is_transient: true,
                is_retryable: false,
                suggested_action: SuggestedAction::Abort,
                user_message: format!(
                    "{} is failing repeatedly, so calls are paused for a while to let it recover.",
                    ctx.tool_name
                ),
                technical_message: technical,
                retry_after_ms: None,
            };
        }

        if matches!(status, Some(401) | Some(403))
            || auth_patterns().is_match(message)
            || auth_patterns().is_match(code)
        {
            return ErrorClassification {
                error_type: ErrorType::Auth,
                is_transient: false,
                is_retryable: true,
                suggested_action: SuggestedAction::Retry,
                user_message: format!(
                    "The connection to {} needs to be re-authorized.",
                    ctx.tool_name
                ),
                technical_message: technical,
                retry_after_ms: None,
            };
        }

        if status == Some(429)
            || error.retry_after_ms.is_some()
            || rate_limit_patterns().is_match(message)
            || rate_limit_patterns().is_match(code)
        {
            return ErrorClassification {
                error_type: ErrorType::RateLimit,
                is_transient: true,
                is_retryable: true,
                suggested_action: SuggestedAction::Retry,
                user_message: format!(
                    "{} is limiting how fast we can send requests. Waiting before trying again.",
                    ctx.tool_name
                ),
                technical_message: technical,
                retry_after_ms: error.retry_after_ms,
            };
        }

        if error.timed_out
            || matches!(status, Some(408) | Some(504))
            || code == "network_error"
            || network_patterns().is_match(message)
        {
            return ErrorClassification {
                error_type: ErrorType::Network,
                is_transient: true,
                is_retryable: true,
                suggested_action: SuggestedAction::Retry,
                user_message: format!("Couldn't reach {}. Trying again.", ctx.tool_name),
                technical_message: technical,
                retry_after_ms: None,
            };
        }

        if let Some(s) = status.filter(|s| (500..600).contains(s)) {
            return ErrorClassification {
                error_type: ErrorType::Server,
                is_transient: true,
                is_retryable: true,
                suggested_action: SuggestedAction::Retry,
                user_message: format!(
                    "{} had a temporary problem (error {}). Trying again.",
                    ctx.tool_name, s
                ),
                technical_message: technical,
                retry_after_ms: None,
            };
        }

        if status == Some(422)
            || (matches!(status, None | Some(400)) && schema_patterns().is_match(message))
        {
            return ErrorClassification {
                error_type: ErrorType::Schema,
                is_transient: false,
                is_retryable: true,
                suggested_action: SuggestedAction::Retry,
                user_message: format!(
                    "The data sent to {} doesn't match what it expects.",
                    ctx.tool_name
                ),
                technical_message: technical,
                retry_after_ms: None,
            };
        }

        ErrorClassification {
            error_type: ErrorType::Unknown,
            is_transient: false,
            is_retryable: false,
            suggested_action: SuggestedAction::Escalate,
            user_message: format!(
                "{} returned an error we can't fix automatically.",
                ctx.tool_name
            ),
            technical_message: technical,
            retry_after_ms: None,
        }
    }
}

fn technical_message(error: &ToolError, ctx: &CallContext) -> String {
    let mut out = format!("[{}/{}] {}", ctx.tool_id, ctx.operation_id, error);
    if let Some(code) = &error.code {
        out.push_str(&format!(" (code: {})", code));
    }
    redact_secrets(&out)
}

/// Stable key for a failure, independent of request ids, counters and
/// timestamps embedded in the message.
pub fn error_signature(error: &ToolError) -> String {
    let mut normalized = error.message.to_lowercase();
    let tokens = volatile_tokens();
    normalized = tokens[0].replace_all(&normalized, "<id>").into_owned();
    normalized = tokens[1].replace_all(&normalized, "<hex>").into_owned();
    normalized = tokens[2].replace_all(&normalized, "#").into_owned();
    normalized = tokens[3].replace_all(normalized.trim(), " ").into_owned();

    let status = error
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| if error.timed_out { "timeout" } else { "-" }.to_string());
    let code = error.code.as_deref().unwrap_or("-");

    let digest = Sha256::digest(normalized.as_bytes());
    let short: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
    format!("{}:{}:{}", status, code, short)
}
