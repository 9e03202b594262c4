//! Unit tests for the circuit breaker registry
//!
//! Tests cover:
//! - Opening after the failure threshold
//! - Single half-open probe
//! - Recovery and reset
//! - Fail-fast healing while open, without contacting the transport

use flowheal::clock::ManualClock;
use flowheal::execution::{ExecutionConfig, ExecutionStatus, WorkflowStep};
use flowheal::self_healing::{CallContext, HealingRequest, HealingStrategy};
use flowheal::simulation::ScriptedTransport;
use flowheal::supervision::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, PermitKind};
use flowheal::{ExecutionRequest, ToolError};
use std::sync::Arc;
use std::time::Duration;

use super::helpers;

fn registry(clock: &ManualClock) -> CircuitBreakerRegistry {
    CircuitBreakerRegistry::with_clock(CircuitBreakerConfig::default(), Arc::new(clock.clone()))
}

mod state_tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..4 {
            breakers.record_failure("X");
        }
        assert_eq!(breakers.get_state("X"), CircuitState::Closed);
        breakers.record_failure("X");
        assert_eq!(breakers.get_state("X"), CircuitState::Open);
        assert_eq!(breakers.trips(), 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..4 {
            breakers.record_failure("X");
        }
        breakers.record_success("X");
        breakers.record_failure("X");
        assert_eq!(breakers.get_state("X"), CircuitState::Closed);
    }

    #[test]
    fn test_rejects_until_half_open_then_one_probe() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..5 {
            breakers.record_failure("X");
        }

        let rejection = breakers.try_acquire("X").err().unwrap();
        assert_eq!(rejection.state, CircuitState::Open);
        assert!(rejection.next_half_open_at.is_some());

        clock.advance(Duration::from_secs(61));
        let probe = breakers.try_acquire("X").unwrap();
        assert_eq!(probe.kind(), PermitKind::Probe);
        assert!(breakers.try_acquire("X").is_err());

        probe.succeed();
        let snapshot = breakers.snapshot("X");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(!snapshot.probe_in_flight);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..5 {
            breakers.record_failure("X");
        }
        clock.advance(Duration::from_secs(61));
        breakers.try_acquire("X").unwrap().fail();
        assert_eq!(breakers.get_state("X"), CircuitState::Open);

        // The open window grows after a failed probe.
        clock.advance(Duration::from_secs(61));
        assert!(breakers.try_acquire("X").is_err());
    }

    #[test]
    fn test_dropped_probe_frees_slot() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..5 {
            breakers.record_failure("X");
        }
        clock.advance(Duration::from_secs(61));
        drop(breakers.try_acquire("X").unwrap());
        assert!(breakers.try_acquire("X").is_ok());
    }

    #[test]
    fn test_reset_closes() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..5 {
            breakers.record_failure("X");
        }
        breakers.reset("X");
        assert_eq!(breakers.get_state("X"), CircuitState::Closed);
        assert!(breakers.try_acquire("X").is_ok());
    }

    #[test]
    fn test_tools_are_independent() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..5 {
            breakers.record_failure("X");
        }
        assert_eq!(breakers.get_state("Y"), CircuitState::Closed);
        assert!(breakers.try_acquire("Y").is_ok());
    }
}

mod fail_fast_tests {
    use super::*;

    #[tokio::test]
    async fn test_open_breaker_fails_fast_in_healing() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        for _ in 0..5 {
            engine.breakers().record_failure("X");
        }
        let (op, calls) = helpers::flaky(0, ToolError::http(503, "down"));

        let result = engine
            .attempt_healing(HealingRequest::new(
                ToolError::circuit_open("X"),
                CallContext::new("X", "sync"),
                op,
            ))
            .await;

        assert!(!result.success);
        assert!(result.escalated);
        assert_eq!(result.attempts[0].strategy, HealingStrategy::CircuitBreak);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_engine_breakers_follow_injected_clock() {
        let clock = ManualClock::new();
        let engine = helpers::engine(&clock);
        for _ in 0..5 {
            engine.breakers().record_failure("X");
        }
        assert!(engine.breakers().try_acquire("X").is_err());

        clock.advance(Duration::from_secs(61));
        let probe = engine.breakers().try_acquire("X").unwrap();
        assert_eq!(probe.kind(), PermitKind::Probe);
    }

    #[test]
    fn test_supplied_registry_keeps_its_clock() {
        let own = ManualClock::new();
        let engine = flowheal::self_healing::HealingStrategyEngine::new(Default::default())
            .with_circuit_breakers(registry(&own))
            .with_clock(Arc::new(ManualClock::new()));
        for _ in 0..5 {
            engine.breakers().record_failure("X");
        }

        own.advance(Duration::from_secs(61));
        assert!(engine.breakers().try_acquire("X").is_ok());
    }

    #[tokio::test]
    async fn test_sixth_call_never_reaches_transport() {
        let clock = ManualClock::new();
        let transport = Arc::new(ScriptedTransport::new());
        let controller = helpers::controller(
            &clock,
            Arc::clone(&transport),
            ExecutionConfig {
                decision_timeout_ms: 50,
                ..Default::default()
            },
        );
        for _ in 0..5 {
            controller.engine().breakers().record_failure("X");
        }

        let started = controller
            .start_autonomous_execution(ExecutionRequest::new(
                "wf",
                vec![WorkflowStep::new("sync", "X", "sync")],
            ))
            .unwrap();
        let state = controller
            .wait_for_terminal(&started.execution_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(transport.call_count("X"), 0);
        let critical = state.critical_error.unwrap();
        assert_eq!(
            critical.healing.attempts[0].strategy,
            HealingStrategy::CircuitBreak
        );
    }
}
