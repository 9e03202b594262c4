//! Unit tests for the healing strategy engine
//!
//! Tests cover:
//! - Rate limit waits honoring retry-after
//! - Retry schedule and exhaustion
//! - Credential refresh, schema adaptation and rerouting
//! - Pattern learning across sessions
//! - Escalation answered by a subscriber

use async_trait::async_trait;
use flowheal::clock::ManualClock;
use flowheal::self_healing::{
    error_signature, AlternateConnection, CallContext, CredentialRefresher, ErrorClassification,
    HealingRequest, HealingStrategy, RerouteProvider, RetryOperation, SchemaAdapter,
    OPTION_ABORT, OPTION_RESUME_WITH_FIX,
};
use flowheal::ToolError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::helpers;

fn ctx() -> CallContext {
    CallContext::new("github", "create_issue").with_tool_name("GitHub")
}

struct AlwaysRefresh;

#[async_trait]
impl CredentialRefresher for AlwaysRefresh {
    async fn refresh(&self, _tool_id: &str, _user_id: Option<&str>) -> anyhow::Result<bool> {
        Ok(true)
    }
}

struct AddTitle;

#[async_trait]
impl SchemaAdapter for AddTitle {
    async fn adapt(
        &self,
        _ctx: &CallContext,
        _classification: &ErrorClassification,
    ) -> anyhow::Result<Option<Value>> {
        Ok(Some(json!({ "title": "Untitled" })))
    }
}

struct Backup;

#[async_trait]
impl RerouteProvider for Backup {
    async fn alternate(&self, _ctx: &CallContext) -> anyhow::Result<Option<AlternateConnection>> {
        Ok(Some(AlternateConnection {
            connection_id: "conn-backup".to_string(),
            tool_id: "github-backup".to_string(),
            label: "backup account".to_string(),
        }))
    }
}

mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limit_waits_retry_after() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        let error = ToolError::http(429, "Too Many Requests").with_retry_after(2000);
        let (op, calls) = helpers::flaky(0, error.clone());

        let result = engine
            .attempt_healing(HealingRequest::new(error, ctx(), op))
            .await;

        assert!(result.success);
        assert_eq!(result.resolved_by, Some(HealingStrategy::RateLimitWait));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(2000)]);
        assert_eq!(result.attempts[0].delay_ms, 2000);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_backs_off_exponentially_then_escalates() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        let error = ToolError::http(503, "Service Unavailable");
        let (op, calls) = helpers::flaky(u32::MAX, error.clone());

        let result = engine
            .attempt_healing(HealingRequest::new(error, ctx(), op))
            .await;

        assert!(!result.success);
        assert!(result.escalated);
        // No subscriber: the escalation defaults to abort.
        assert_eq!(result.chosen_option.as_deref(), Some(OPTION_ABORT));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
            ]
        );
        assert_eq!(result.total_attempts, 3);
        assert!(result.escalation_reason.unwrap().contains("retry"));
    }

    #[tokio::test]
    async fn test_transient_errors_always_invoke_operation() {
        let transient = [
            ToolError::http(503, "Service Unavailable"),
            ToolError::http(500, "Internal Server Error"),
            ToolError::timeout("no response within 30000ms"),
            ToolError::network("connection reset by peer"),
            ToolError::http(429, "Too Many Requests"),
        ];
        for error in transient {
            let clock = ManualClock::new();
            let engine = helpers::engine(&clock);
            let (op, calls) = helpers::flaky(0, error.clone());
            let result = engine
                .attempt_healing(HealingRequest::new(error.clone(), ctx(), op))
                .await;
            assert!(calls.load(Ordering::SeqCst) >= 1, "{}", error);
            assert!(result.success, "{}", error);
        }
    }

    #[tokio::test]
    async fn test_switches_strategy_when_error_changes() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op: RetryOperation = Arc::new(move |_attempt| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    Err(ToolError::http(429, "slow down").with_retry_after(750))
                } else {
                    Ok(json!({ "n": n }))
                }
            })
        });

        let result = engine
            .attempt_healing(HealingRequest::new(
                ToolError::http(503, "Service Unavailable"),
                ctx(),
                op,
            ))
            .await;

        assert!(result.success);
        assert_eq!(result.resolved_by, Some(HealingStrategy::RateLimitWait));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(1000), Duration::from_millis(750)]
        );
    }
}

mod collaborator_tests {
    use super::*;

    #[tokio::test]
    async fn test_refresh_auth_then_succeed() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock).with_credential_refresher(Arc::new(AlwaysRefresh));
        let error = ToolError::http(401, "token expired");
        let (op, calls) = helpers::flaky(0, error.clone());

        let result = engine
            .attempt_healing(HealingRequest::new(error, ctx(), op).with_user("user-1"))
            .await;

        assert!(result.success);
        assert_eq!(result.resolved_by, Some(HealingStrategy::RefreshAuth));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_auth_without_refresher_escalates_uninvoked() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        let error = ToolError::http(401, "token expired");
        let (op, calls) = helpers::flaky(0, error.clone());

        let result = engine
            .attempt_healing(HealingRequest::new(error, ctx(), op))
            .await;

        assert!(!result.success);
        assert!(result.escalated);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            result.attempts[0].note.as_deref(),
            Some("credential refresh declined")
        );
    }

    #[tokio::test]
    async fn test_schema_adaptation_overrides_payload() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock).with_schema_adapter(Arc::new(AddTitle));
        let op: RetryOperation = Arc::new(|attempt| {
            Box::pin(async move {
                match attempt.payload_override {
                    Some(payload) if payload["title"] == "Untitled" => Ok(payload),
                    _ => Err(ToolError::http(422, "missing field 'title'")),
                }
            })
        });

        let result = engine
            .attempt_healing(HealingRequest::new(
                ToolError::http(422, "missing field 'title'"),
                ctx(),
                op,
            ))
            .await;

        assert!(result.success);
        assert_eq!(result.resolved_by, Some(HealingStrategy::SchemaAdapt));
        assert_eq!(result.output, Some(json!({ "title": "Untitled" })));
    }

    #[tokio::test]
    async fn test_reroute_after_retries_exhausted() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock).with_reroute_provider(Arc::new(Backup));
        let op: RetryOperation = Arc::new(|attempt| {
            Box::pin(async move {
                match attempt.connection {
                    Some(alternate) => Ok(json!({ "via": alternate.connection_id })),
                    None => Err(ToolError::http(503, "Service Unavailable")),
                }
            })
        });

        let result = engine
            .attempt_healing(HealingRequest::new(
                ToolError::http(503, "Service Unavailable"),
                ctx(),
                op,
            ))
            .await;

        assert!(result.success);
        assert_eq!(result.resolved_by, Some(HealingStrategy::Reroute));
        assert_eq!(result.total_attempts, 4);
        assert_eq!(result.output, Some(json!({ "via": "conn-backup" })));
        let last = result.attempts.last().unwrap();
        assert_eq!(last.note.as_deref(), Some("via backup account"));
    }
}

mod pattern_tests {
    use super::*;

    #[tokio::test]
    async fn test_pattern_trusted_after_repeated_success() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        let error = ToolError::http(503, "Service Unavailable");
        let signature = error_signature(&error);

        for round in 1..=5 {
            let (op, _) = helpers::flaky(0, error.clone());
            let result = engine
                .attempt_healing(HealingRequest::new(error.clone(), ctx(), op))
                .await;
            assert!(result.success);
            let trusted = engine.patterns().lookup(&signature, "github").is_some();
            assert_eq!(trusted, round == 5, "round {}", round);
        }

        let stored = engine.patterns().get(&signature, "github").unwrap();
        assert_eq!(stored.strategy, HealingStrategy::Retry);
        assert_eq!(stored.success_count, 5);
        assert!(stored.confidence_score > 0.8);

        let (op, _) = helpers::flaky(0, error.clone());
        let result = engine
            .attempt_healing(HealingRequest::new(error, ctx(), op))
            .await;
        assert_eq!(result.pattern_id.as_deref(), Some(stored.id.as_str()));
        assert!(engine.metrics_snapshot().patterns_learned >= 1);
    }

    #[tokio::test]
    async fn test_patterns_are_per_tool() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        let error = ToolError::http(503, "Service Unavailable");
        let (op, _) = helpers::flaky(0, error.clone());
        engine
            .attempt_healing(HealingRequest::new(error.clone(), ctx(), op))
            .await;

        assert!(engine
            .patterns()
            .get(&error_signature(&error), "slack")
            .is_none());
    }
}

mod escalation_tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_resumes_with_fix() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        let mut escalations = engine.escalation().subscribe(4);
        let answer = tokio::spawn(async move {
            let request = escalations.recv().await.unwrap();
            assert!(request
                .options
                .iter()
                .any(|o| o.id == OPTION_RESUME_WITH_FIX));
            request.resolve(
                OPTION_RESUME_WITH_FIX,
                Some(r#"{"tea": false}"#.to_string()),
                Some("user-1".to_string()),
            )
        });
        let op: RetryOperation = Arc::new(|attempt| {
            Box::pin(async move {
                match attempt.payload_override {
                    Some(payload) => Ok(payload),
                    None => Err(ToolError::http(418, "I'm a teapot")),
                }
            })
        });

        let result = engine
            .attempt_healing(HealingRequest::new(
                ToolError::http(418, "I'm a teapot"),
                ctx(),
                op,
            ))
            .await;

        assert!(answer.await.unwrap());
        assert!(result.success);
        assert!(result.escalated);
        assert_eq!(result.resolved_by, Some(HealingStrategy::Escalate));
        assert_eq!(result.chosen_option.as_deref(), Some(OPTION_RESUME_WITH_FIX));
        assert_eq!(result.output, Some(json!({ "tea": false })));
    }

    #[tokio::test]
    async fn test_subscriber_abort_leaves_failure() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        let mut escalations = engine.escalation().subscribe(4);
        tokio::spawn(async move {
            if let Some(request) = escalations.recv().await {
                request.resolve(OPTION_ABORT, None, None);
            }
        });
        let (op, calls) = helpers::flaky(0, ToolError::http(404, "Not Found"));

        let result = engine
            .attempt_healing(HealingRequest::new(
                ToolError::http(404, "Not Found"),
                ctx(),
                op,
            ))
            .await;

        assert!(!result.success);
        assert_eq!(result.chosen_option.as_deref(), Some(OPTION_ABORT));
        assert!(result.final_error.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
