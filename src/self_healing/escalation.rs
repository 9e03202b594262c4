//! Escalation hand-off
//!
//! When automatic recovery is exhausted the engine hands the failure to a
//! human. A consumer (UI, CLI, test) subscribes and receives
//! [`EscalationRequest`]s over a channel; each request carries a one-shot
//! responder. The engine waits for the answer with a timeout.
//!
//! Every failure to get an answer resolves to `abort`:
//! - nobody subscribed
//! - the subscriber's queue is full or closed
//! - the responder was dropped
//! - the timeout elapsed

use super::{HealingUserOption, SelfHealingSession, OPTION_ABORT};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// The answer to an escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationOutcome {
    pub option_id: String,
    pub input_value: Option<String>,
    pub decided_by: Option<String>,
    /// True when no answer arrived and `abort` was applied
    pub timed_out: bool,
}

impl EscalationOutcome {
    pub fn abort_default(timed_out: bool) -> Self {
        Self {
            option_id: OPTION_ABORT.to_string(),
            input_value: None,
            decided_by: None,
            timed_out,
        }
    }
}

/// A pending decision delivered to the subscriber.
#[derive(Debug)]
pub struct EscalationRequest {
    pub id: String,
    pub session: SelfHealingSession,
    pub options: Vec<HealingUserOption>,
    pub reason: String,
    responder: oneshot::Sender<EscalationOutcome>,
}

impl EscalationRequest {
    /// Answer the escalation. Returns false if the engine stopped waiting.
    pub fn resolve(
        self,
        option_id: &str,
        input_value: Option<String>,
        decided_by: Option<String>,
    ) -> bool {
        self.responder
            .send(EscalationOutcome {
                option_id: option_id.to_string(),
                input_value,
                decided_by,
                timed_out: false,
            })
            .is_ok()
    }
}

pub struct EscalationCoordinator {
    timeout: Duration,
    subscriber: Mutex<Option<mpsc::Sender<EscalationRequest>>>,
}

impl EscalationCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            subscriber: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register the single consumer, replacing any previous one.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<EscalationRequest> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.subscriber.lock() = Some(tx);
        rx
    }

    pub fn unsubscribe(&self) {
        *self.subscriber.lock() = None;
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Hand the session to the subscriber and wait for a decision.
    pub async fn escalate(
        &self,
        session: SelfHealingSession,
        options: Vec<HealingUserOption>,
        reason: &str,
    ) -> EscalationOutcome {
        let Some(tx) = self.subscriber.lock().clone() else {
            info!(session_id = %session.id, "No escalation subscriber, defaulting to abort");
            return EscalationOutcome::abort_default(false);
        };

        let (responder, rx) = oneshot::channel();
        let request = EscalationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session,
            options,
            reason: reason.to_string(),
            responder,
        };
        let session_id = request.session.id.clone();

        if tx.try_send(request).is_err() {
            warn!(session_id = %session_id, "Escalation subscriber unavailable, defaulting to abort");
            return EscalationOutcome::abort_default(false);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => {
                info!(
                    session_id = %session_id,
                    option = %outcome.option_id,
                    "Escalation resolved"
                );
                outcome
            }
            Ok(Err(_)) => {
                warn!(session_id = %session_id, "Escalation responder dropped, defaulting to abort");
                EscalationOutcome::abort_default(false)
            }
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Escalation timed out, defaulting to abort"
                );
                EscalationOutcome::abort_default(true)
            }
        }
    }
}

impl Default for EscalationCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
