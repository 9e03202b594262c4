//! Healing session table.
//!
//! One [`SelfHealingSession`] exists per in-flight recovery. Finished
//! sessions move into a bounded history so callers can still inspect the
//! result after the fact.

use super::{CallContext, HealingResult, HealingStrategy};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfHealingSession {
    pub id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub operation_id: String,
    pub operation_type: String,
    pub execution_id: Option<String>,
    pub current_strategy: Option<HealingStrategy>,
    pub current_attempt: u32,
    pub is_paused: bool,
    pub is_active: bool,
    pub result: Option<HealingResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SelfHealingSession {
    pub fn new(
        id: String,
        ctx: &CallContext,
        execution_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tool_id: ctx.tool_id.clone(),
            tool_name: ctx.tool_name.clone(),
            operation_id: ctx.operation_id.clone(),
            operation_type: ctx.operation_type.clone(),
            execution_id,
            current_strategy: None,
            current_attempt: 0,
            is_paused: false,
            is_active: true,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

struct ActiveSession {
    session: SelfHealingSession,
    cancel: CancellationToken,
}

pub struct SessionStore {
    active: RwLock<HashMap<String, ActiveSession>>,
    finished: Mutex<VecDeque<SelfHealingSession>>,
    history: usize,
}

impl SessionStore {
    /// `history` is the number of finished sessions kept.
    pub fn new(history: usize) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            history,
        }
    }

    pub(crate) fn open(&self, session: SelfHealingSession, cancel: CancellationToken) {
        self.active
            .write()
            .insert(session.id.clone(), ActiveSession { session, cancel });
    }

    pub(crate) fn update<F>(&self, id: &str, now: DateTime<Utc>, f: F)
    where
        F: FnOnce(&mut SelfHealingSession),
    {
        if let Some(entry) = self.active.write().get_mut(id) {
            f(&mut entry.session);
            entry.session.updated_at = now;
        }
    }

    /// Attach the result and move the session into history.
    pub(crate) fn finish(&self, id: &str, result: HealingResult, now: DateTime<Utc>) {
        let Some(entry) = self.active.write().remove(id) else {
            return;
        };
        let mut session = entry.session;
        session.is_active = false;
        session.is_paused = false;
        session.result = Some(result);
        session.updated_at = now;

        let mut finished = self.finished.lock();
        finished.push_back(session);
        while finished.len() > self.history {
            finished.pop_front();
        }
    }

    /// Active or recently finished session by id.
    pub fn get_session(&self, id: &str) -> Option<SelfHealingSession> {
        if let Some(entry) = self.active.read().get(id) {
            return Some(entry.session.clone());
        }
        self.finished.lock().iter().find(|s| s.id == id).cloned()
    }

    pub fn active_sessions(&self) -> Vec<SelfHealingSession> {
        let mut sessions: Vec<_> = self
            .active
            .read()
            .values()
            .map(|e| e.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Results of finished sessions, oldest first.
    pub fn recent_results(&self) -> Vec<HealingResult> {
        self.finished
            .lock()
            .iter()
            .filter_map(|s| s.result.clone())
            .collect()
    }

    /// Ask an active session to stop. Returns false if it is not active.
    pub fn cancel_session(&self, id: &str) -> bool {
        match self.active.read().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(100)
    }
}
