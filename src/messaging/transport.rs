use async_trait::async_trait;
use serde_json::Value;

use crate::rpc::CallError;

// ============================================================================
// Broker Transport Capability
// ============================================================================
//
// What the resilience layer needs from a message broker client:
// request/response by pattern, fire-and-forget events, and a one-time
// connect step that establishes reply subscriptions.
//
// ============================================================================

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the broker connection and reply subscriptions.
    /// Calling it again after success is a no-op.
    async fn connect(&self) -> Result<(), CallError>;

    /// Request/response call, resolved by the remote handler's reply
    async fn send(&self, pattern: &str, payload: Value) -> Result<Value, CallError>;

    /// Fire-and-forget event publication
    async fn emit(&self, event: &str, payload: Value) -> Result<(), CallError>;
}
