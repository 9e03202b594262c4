use crate::errors::ToolError;
use async_trait::async_trait;
use serde_json::Value;

/// Invokes a tool operation. Implemented by whatever talks to the SaaS API.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn execute(
        &self,
        tool_id: &str,
        operation_id: &str,
        payload: Value,
    ) -> Result<Value, ToolError>;
}
