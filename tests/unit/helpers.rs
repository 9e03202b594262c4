//! Shared fixtures for the unit tests.

use flowheal::clock::{ManualClock, NoJitter};
use flowheal::execution::{
    AutonomousExecutionController, ExecutionConfig, ExecutionEvent, ExecutionEventKind,
};
use flowheal::self_healing::{HealingConfig, HealingStrategyEngine, RetryOperation};
use flowheal::simulation::ScriptedTransport;
use flowheal::ToolError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Engine on a manual clock with jitter disabled.
pub fn engine(clock: &ManualClock) -> HealingStrategyEngine {
    HealingStrategyEngine::new(HealingConfig::default())
        .with_clock(Arc::new(clock.clone()))
        .with_jitter(Arc::new(NoJitter))
}

pub fn controller(
    clock: &ManualClock,
    transport: Arc<ScriptedTransport>,
    config: ExecutionConfig,
) -> AutonomousExecutionController {
    AutonomousExecutionController::new(Arc::new(engine(clock)), transport, config)
}

/// Operation that fails `failures` times with `error`, then returns `{"ok": true}`.
pub fn flaky(failures: u32, error: ToolError) -> (RetryOperation, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let op: RetryOperation = Arc::new(move |_attempt| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        let error = error.clone();
        Box::pin(async move {
            if n < failures {
                Err(error)
            } else {
                Ok(json!({ "ok": true }))
            }
        })
    });
    (op, calls)
}

pub fn ok(value: Value) -> flowheal::simulation::ScriptedOutcome {
    flowheal::simulation::ScriptedOutcome::Ok(value)
}

pub fn err(error: ToolError) -> flowheal::simulation::ScriptedOutcome {
    flowheal::simulation::ScriptedOutcome::Error(error)
}

/// Wait for the next event of `kind` for `execution_id`.
pub async fn next_event(
    events: &mut broadcast::Receiver<ExecutionEvent>,
    execution_id: &str,
    kind: ExecutionEventKind,
) -> ExecutionEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.execution_id == execution_id && event.kind == kind => {
                    return event;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("no {:?} event within 5s", kind))
}
