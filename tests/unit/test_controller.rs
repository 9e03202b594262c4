//! Unit tests for the autonomous execution controller
//!
//! Tests cover:
//! - Pausing on escalation and resuming with each decision
//! - Cancellation with partial results
//! - Decision timeout
//! - Event stream ordering and progress

use flowheal::clock::ManualClock;
use flowheal::execution::{
    AutonomousExecutionController, CriticalErrorDecision, ExecutionConfig, ExecutionEventKind,
    ExecutionPhase, ExecutionStatus, PartialStatus, WorkflowStep,
};
use flowheal::self_healing::{OPTION_ABORT, OPTION_RESUME_WITH_FIX, OPTION_SKIP_STEP};
use flowheal::simulation::ScriptedTransport;
use flowheal::{ExecutionRequest, FlowhealError, ToolError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::helpers::{self, err, next_event, ok};

const WAIT: Duration = Duration::from_secs(5);

fn three_steps() -> ExecutionRequest {
    ExecutionRequest::new(
        "digest",
        vec![
            WorkflowStep::new("fetch", "github", "list_issues").with_cost(0.5),
            WorkflowStep::new("summarize", "llm", "summarize").with_cost(0.5),
            WorkflowStep::new("post", "slack", "post_message").with_cost(0.5),
        ],
    )
    .with_user("user-1")
}

fn setup(config: ExecutionConfig) -> (AutonomousExecutionController, Arc<ScriptedTransport>) {
    let clock = ManualClock::new();
    let transport = Arc::new(ScriptedTransport::new());
    let controller = helpers::controller(&clock, Arc::clone(&transport), config);
    (controller, transport)
}

mod decision_tests {
    use super::*;

    #[tokio::test]
    async fn test_skip_step_after_escalation() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.script(
            "llm",
            "summarize",
            vec![err(ToolError::http(503, "Service Unavailable"))],
        );
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id.clone();
        let paused = next_event(&mut events, &id, ExecutionEventKind::NeedsDecision).await;

        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.step_index, 1);
        let critical = paused.critical_error.unwrap();
        assert_eq!(critical.step_name, "summarize");
        assert!(critical.allows(OPTION_SKIP_STEP));
        // One initial call plus three retries.
        assert_eq!(transport.call_count("llm"), 4);

        let state = controller.get_execution_state(&id).unwrap();
        assert_eq!(state.phase, ExecutionPhase::AwaitingDecision);

        let resumed = controller
            .resume_execution(&id, CriticalErrorDecision::new(OPTION_SKIP_STEP, "user-1"))
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        assert_eq!(resumed.current_step_index, 2);

        let state = controller.wait_for_terminal(&id, WAIT).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.partial_results.count(PartialStatus::Completed), 2);
        assert_eq!(state.partial_results.count(PartialStatus::Skipped), 1);
        assert_eq!(state.current_cost, 1.0);
        assert_eq!(
            state.last_decision.as_ref().map(|d| d.decided_by.as_str()),
            Some("user-1")
        );
    }

    #[tokio::test]
    async fn test_resume_with_fix_uses_input_as_payload() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.script(
            "slack",
            "post_message",
            vec![
                err(ToolError::http(422, "missing field 'channel'")),
                ok(json!({ "ts": "1700000000.000100" })),
            ],
        );
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id.clone();
        next_event(&mut events, &id, ExecutionEventKind::NeedsDecision).await;

        controller
            .resume_execution(
                &id,
                CriticalErrorDecision::new(OPTION_RESUME_WITH_FIX, "user-1")
                    .with_input(r##"{"channel": "#ops"}"##),
            )
            .unwrap();

        let state = controller.wait_for_terminal(&id, WAIT).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        let last = transport.calls().pop().unwrap();
        assert_eq!(last.tool_id, "slack");
        assert_eq!(last.payload, json!({ "channel": "#ops" }));
        let post = &state.partial_results.results()[2];
        assert_eq!(post.status, PartialStatus::Completed);
        assert_eq!(post.artifacts[0]["ts"], "1700000000.000100");
        // The failed call and the fixed call are both billed.
        assert_eq!(state.current_cost, 2.0);
    }

    #[tokio::test]
    async fn test_failed_fix_pauses_again() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.script(
            "slack",
            "post_message",
            vec![err(ToolError::http(422, "missing field 'channel'"))],
        );
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id.clone();
        next_event(&mut events, &id, ExecutionEventKind::NeedsDecision).await;
        controller
            .resume_execution(
                &id,
                CriticalErrorDecision::new(OPTION_RESUME_WITH_FIX, "user-1").with_input("#ops"),
            )
            .unwrap();

        let again = next_event(&mut events, &id, ExecutionEventKind::NeedsDecision).await;
        let critical = again.critical_error.unwrap();
        assert!(critical
            .healing
            .escalation_reason
            .unwrap()
            .contains("did not resolve"));

        controller
            .resume_execution(&id, CriticalErrorDecision::new(OPTION_ABORT, "user-1"))
            .unwrap();
        let state = controller.wait_for_terminal(&id, WAIT).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.final_results.map(|r| r.len()), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.script("github", "list_issues", vec![err(ToolError::http(418, "teapot"))]);
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id.clone();
        next_event(&mut events, &id, ExecutionEventKind::NeedsDecision).await;

        let result =
            controller.resume_execution(&id, CriticalErrorDecision::new("retry-forever", "user-1"));
        assert!(matches!(result, Err(FlowhealError::InvalidDecision { .. })));
        assert_eq!(
            controller.get_execution_state(&id).unwrap().status,
            ExecutionStatus::Paused
        );

        controller
            .cancel_execution(&id, "test finished", "user-1", false)
            .unwrap();
    }

    #[tokio::test]
    async fn test_decision_timeout_aborts() {
        let (controller, transport) = setup(ExecutionConfig {
            decision_timeout_ms: 50,
            ..Default::default()
        });
        transport.script("github", "list_issues", vec![err(ToolError::http(418, "teapot"))]);

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let state = controller
            .wait_for_terminal(&started.execution_id, WAIT)
            .await
            .unwrap();

        assert_eq!(state.status, ExecutionStatus::Failed);
        let decision = state.last_decision.unwrap();
        assert_eq!(decision.action_id, OPTION_ABORT);
        assert_eq!(decision.decided_by, "system:timeout");
        assert_eq!(transport.call_count("llm"), 0);
    }
}

mod cancel_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_mid_step_saves_partial() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.set_latency("llm", "summarize", Duration::from_secs(5));
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id.clone();
        loop {
            let event = next_event(&mut events, &id, ExecutionEventKind::StepStarted).await;
            if event.step_index == 1 {
                break;
            }
        }

        let state = controller
            .cancel_execution(&id, "user request", "user-1", true)
            .unwrap();
        assert_eq!(state.status, ExecutionStatus::Cancelled);
        let finals = state.final_results.unwrap();
        let statuses: Vec<_> = finals.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![PartialStatus::Completed, PartialStatus::Partial]);
        let cancellation = state.cancellation.unwrap();
        assert_eq!(cancellation.reason, "user request");
        assert_eq!(cancellation.cancelled_by, "user-1");

        next_event(&mut events, &id, ExecutionEventKind::Cancelled).await;
        assert_eq!(transport.call_count("slack"), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_skip_leaves_next_step_untouched() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.script("llm", "summarize", vec![err(ToolError::http(404, "Not Found"))]);
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id.clone();
        next_event(&mut events, &id, ExecutionEventKind::NeedsDecision).await;

        let resumed = controller
            .resume_execution(&id, CriticalErrorDecision::new(OPTION_SKIP_STEP, "user-1"))
            .unwrap();
        assert_eq!(resumed.current_step_index, 2);
        assert_eq!(resumed.phase, ExecutionPhase::BetweenSteps);

        // No await in between: the execution task has not started step 2.
        let state = controller
            .cancel_execution(&id, "user request", "user-1", true)
            .unwrap();
        let finals: Vec<_> = state
            .final_results
            .unwrap()
            .iter()
            .map(|r| (r.step_index, r.status))
            .collect();
        assert_eq!(
            finals,
            vec![(0, PartialStatus::Completed), (1, PartialStatus::Skipped)]
        );

        next_event(&mut events, &id, ExecutionEventKind::Cancelled).await;
        assert_eq!(transport.call_count("slack"), 0);
    }

    #[tokio::test]
    async fn test_cancel_without_saving() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.set_latency("github", "list_issues", Duration::from_secs(5));

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let state = controller
            .cancel_execution(&started.execution_id, "stop", "user-1", false)
            .unwrap();
        assert!(state.final_results.is_none());
    }

    #[tokio::test]
    async fn test_cancel_twice_is_invalid() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.set_latency("github", "list_issues", Duration::from_secs(5));

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id;
        controller.cancel_execution(&id, "stop", "user-1", true).unwrap();
        let second = controller.cancel_execution(&id, "stop", "user-1", true);
        assert!(matches!(
            second,
            Err(FlowhealError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.script("llm", "summarize", vec![err(ToolError::http(404, "no model"))]);
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id.clone();
        next_event(&mut events, &id, ExecutionEventKind::NeedsDecision).await;

        let state = controller.cancel_execution(&id, "stop", "user-1", true).unwrap();
        assert_eq!(state.status, ExecutionStatus::Cancelled);
        assert!(controller
            .resume_execution(&id, CriticalErrorDecision::new(OPTION_SKIP_STEP, "user-1"))
            .is_err());
    }
}

mod state_tests {
    use super::*;

    #[tokio::test]
    async fn test_state_reads_are_idempotent() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.set_latency("github", "list_issues", Duration::from_secs(5));
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        next_event(&mut events, &started.execution_id, ExecutionEventKind::StepStarted).await;
        let first = controller.get_execution_state(&started.execution_id).unwrap();
        let second = controller.get_execution_state(&started.execution_id).unwrap();
        assert_eq!(first, second);

        controller
            .cancel_execution(&started.execution_id, "stop", "user-1", false)
            .unwrap();
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let (controller, transport) = setup(ExecutionConfig::default());
        transport.script(
            "llm",
            "summarize",
            vec![err(ToolError::http(503, "Service Unavailable")), ok(json!({}))],
        );
        let mut events = controller.subscribe();

        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        let id = started.execution_id.clone();
        let collect = async {
            let mut seen = Vec::new();
            loop {
                let event = events.recv().await.unwrap();
                if event.execution_id != id {
                    continue;
                }
                let done = event.kind == ExecutionEventKind::Completed;
                seen.push(event);
                if done {
                    return seen;
                }
            }
        };
        let seen = tokio::time::timeout(WAIT, collect).await.unwrap();

        assert_eq!(seen.first().map(|e| e.kind), Some(ExecutionEventKind::Started));
        assert!(seen.iter().any(|e| e.kind == ExecutionEventKind::Healing));
        for pair in seen.windows(2) {
            assert!(pair[0].progress <= pair[1].progress);
        }
        assert_eq!(seen.last().unwrap().progress, 100.0);
    }

    #[tokio::test]
    async fn test_list_and_metrics() {
        let (controller, _transport) = setup(ExecutionConfig::default());
        let a = controller.start_autonomous_execution(three_steps()).unwrap();
        let b = controller.start_autonomous_execution(three_steps()).unwrap();
        controller.wait_for_terminal(&a.execution_id, WAIT).await.unwrap();
        controller.wait_for_terminal(&b.execution_id, WAIT).await.unwrap();

        assert_eq!(controller.list_executions().len(), 2);
        let metrics = controller.execution_metrics();
        assert_eq!(metrics.total_executions, 2);
        assert_eq!(metrics.successful_executions, 2);
        assert_eq!(metrics.total_cost, 3.0);
        assert_eq!(metrics.avg_cost_per_connection, 0.5);
    }

    #[tokio::test]
    async fn test_log_records_lifecycle() {
        let (controller, _transport) = setup(ExecutionConfig::default());
        let started = controller.start_autonomous_execution(three_steps()).unwrap();
        controller
            .wait_for_terminal(&started.execution_id, WAIT)
            .await
            .unwrap();

        let events: Vec<_> = controller
            .execution_log(&started.execution_id)
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events.first().map(String::as_str), Some("started"));
        assert_eq!(events.last().map(String::as_str), Some("completed"));
        assert_eq!(events.iter().filter(|e| *e == "step_completed").count(), 3);
    }
}
