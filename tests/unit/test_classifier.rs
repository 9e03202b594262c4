//! Unit tests for error classification
//!
//! Tests cover:
//! - Priority order of the classification rules
//! - Strategy mapping for each error type
//! - Signature stability across volatile message parts

use flowheal::self_healing::{
    error_signature, CallContext, ErrorClassifier, ErrorType, HealingStrategy, SuggestedAction,
};
use flowheal::ToolError;

fn ctx() -> CallContext {
    CallContext::new("github", "create_issue").with_tool_name("GitHub")
}

fn classify(error: &ToolError) -> flowheal::ErrorClassification {
    ErrorClassifier::new().classify(error, &ctx())
}

mod priority_tests {
    use super::*;

    #[test]
    fn test_auth_beats_rate_limit() {
        let error = ToolError::http(401, "rate limit reached for expired token");
        assert_eq!(classify(&error).error_type, ErrorType::Auth);
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let error = ToolError::http(429, "Too Many Requests").with_retry_after(2000);
        let class = classify(&error);
        assert_eq!(class.error_type, ErrorType::RateLimit);
        assert_eq!(class.retry_after_ms, Some(2000));
        assert!(class.is_transient);
    }

    #[test]
    fn test_retry_after_without_status_is_rate_limit() {
        let error = ToolError::new("slow down").with_retry_after(500);
        assert_eq!(classify(&error).error_type, ErrorType::RateLimit);
    }

    #[test]
    fn test_timeout_is_network() {
        let class = classify(&ToolError::timeout("no response within 30000ms"));
        assert_eq!(class.error_type, ErrorType::Network);
        assert!(class.is_transient && class.is_retryable);
    }

    #[test]
    fn test_gateway_timeout_is_network_not_server() {
        assert_eq!(
            classify(&ToolError::http(504, "Gateway Timeout")).error_type,
            ErrorType::Network
        );
    }

    #[test]
    fn test_5xx_is_server() {
        let class = classify(&ToolError::http(502, "Bad Gateway"));
        assert_eq!(class.error_type, ErrorType::Server);
        assert!(class.is_transient);
        assert!(class.user_message.contains("GitHub"));
    }

    #[test]
    fn test_schema_validation() {
        let class = classify(&ToolError::http(400, "Validation failed: missing field 'title'"));
        assert_eq!(class.error_type, ErrorType::Schema);
        assert!(!class.is_transient);
    }

    #[test]
    fn test_unknown_is_not_retryable() {
        let class = classify(&ToolError::http(418, "I'm a teapot"));
        assert_eq!(class.error_type, ErrorType::Unknown);
        assert!(!class.is_retryable);
        assert_eq!(class.suggested_action, SuggestedAction::Escalate);
    }

    #[test]
    fn test_circuit_open_marker() {
        let class = classify(&ToolError::circuit_open("github"));
        assert_eq!(class.error_type, ErrorType::CircuitOpen);
        assert!(!class.is_retryable);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let error = ToolError::http(503, "Service Unavailable");
        assert_eq!(classify(&error), classify(&error));
    }

    #[test]
    fn test_secrets_redacted_in_technical_message() {
        let error = ToolError::http(401, "bad credentials Bearer abc.def.ghi");
        let class = classify(&error);
        assert!(!class.technical_message.contains("abc.def.ghi"));
        assert!(class.technical_message.contains("github/create_issue"));
    }
}

mod strategy_tests {
    use super::*;

    #[test]
    fn test_each_type_maps_to_its_strategy() {
        let cases = [
            (ToolError::http(403, "Forbidden"), HealingStrategy::RefreshAuth),
            (ToolError::http(429, "slow"), HealingStrategy::RateLimitWait),
            (ToolError::network("connection reset"), HealingStrategy::Retry),
            (ToolError::http(500, "oops"), HealingStrategy::Retry),
            (ToolError::http(422, "Unprocessable"), HealingStrategy::SchemaAdapt),
            (ToolError::circuit_open("github"), HealingStrategy::CircuitBreak),
            (ToolError::http(404, "Not Found"), HealingStrategy::Escalate),
        ];
        for (error, expected) in cases {
            assert_eq!(
                HealingStrategy::for_classification(&classify(&error)),
                expected,
                "{}",
                error
            );
        }
    }
}

mod signature_tests {
    use super::*;

    #[test]
    fn test_signature_ignores_request_ids() {
        let a = ToolError::http(503, "upstream 7f3c9a1e-0b5d-4c7e-9e1a-2b3c4d5e6f70 unavailable");
        let b = ToolError::http(503, "upstream 11111111-2222-3333-4444-555555555555 unavailable");
        assert_eq!(error_signature(&a), error_signature(&b));
    }

    #[test]
    fn test_signature_distinguishes_status() {
        let a = ToolError::http(503, "unavailable");
        let b = ToolError::http(502, "unavailable");
        assert_ne!(error_signature(&a), error_signature(&b));
    }
}
