//! External collaborators the engine calls out to while healing.
//!
//! The engine never talks to an OAuth proxy, a schema mapper or a tool
//! catalog directly. It goes through these traits, and the defaults do
//! nothing so a bare engine still works.

use super::{CallContext, ErrorClassification};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Re-issues credentials for a tool connection.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Returns `Ok(true)` if fresh credentials are now in place.
    async fn refresh(&self, tool_id: &str, user_id: Option<&str>) -> anyhow::Result<bool>;
}

/// Re-maps a payload after the tool rejected its shape.
#[async_trait]
pub trait SchemaAdapter: Send + Sync {
    /// Returns the adapted payload, or `None` if no adaptation is known.
    async fn adapt(
        &self,
        ctx: &CallContext,
        classification: &ErrorClassification,
    ) -> anyhow::Result<Option<Value>>;
}

/// A substitute connection for a failing tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateConnection {
    pub connection_id: String,
    pub tool_id: String,
    pub label: String,
}

/// Supplies alternate connections when the primary keeps failing.
#[async_trait]
pub trait RerouteProvider: Send + Sync {
    async fn alternate(&self, ctx: &CallContext) -> anyhow::Result<Option<AlternateConnection>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCredentialRefresher;

#[async_trait]
impl CredentialRefresher for NoopCredentialRefresher {
    async fn refresh(&self, _tool_id: &str, _user_id: Option<&str>) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSchemaAdapter;

#[async_trait]
impl SchemaAdapter for NoopSchemaAdapter {
    async fn adapt(
        &self,
        _ctx: &CallContext,
        _classification: &ErrorClassification,
    ) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRerouteProvider;

#[async_trait]
impl RerouteProvider for NoopRerouteProvider {
    async fn alternate(&self, _ctx: &CallContext) -> anyhow::Result<Option<AlternateConnection>> {
        Ok(None)
    }
}
