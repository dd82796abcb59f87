//! Built-in capabilities for smoke testing a sandbox.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use stepwise_core::capability::{
    ApprovalRule, Capability, CapabilityError, CapabilityMeta, CapabilityRegistry,
    InvocationContext,
};

fn params_get_string(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn params_get_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

/// Echo capability. Asks for approval when called with `"sensitive": true`.
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the message back as output"
    }

    fn metadata(&self) -> CapabilityMeta {
        CapabilityMeta::new(self.name(), self.description())
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "sensitive": {"type": "boolean"}
                }
            }))
            .with_output_schema(json!({
                "type": "object",
                "required": ["result"]
            }))
            .with_approval(ApprovalRule::when(|args| {
                params_get_bool(args, "sensitive").unwrap_or(false)
            }))
    }

    async fn invoke(&self, args: Value, _ctx: InvocationContext) -> Result<Value, CapabilityError> {
        let message =
            params_get_string(&args, "message").unwrap_or_else(|| "No message provided".to_string());
        Ok(json!({ "result": message }))
    }
}

/// Sleeps for `ms` milliseconds, stopping early on cancellation.
pub struct SleepCapability;

#[async_trait]
impl Capability for SleepCapability {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Waits for the given number of milliseconds"
    }

    fn metadata(&self) -> CapabilityMeta {
        CapabilityMeta::new(self.name(), self.description())
            .with_input_schema(json!({
                "type": "object",
                "required": ["ms"],
                "properties": {"ms": {"type": "integer"}}
            }))
            .with_timeout(Duration::from_secs(600))
    }

    async fn invoke(&self, args: Value, ctx: InvocationContext) -> Result<Value, CapabilityError> {
        let ms = args
            .get("ms")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CapabilityError::InvalidArguments("ms must be a non-negative integer".to_string()))?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            _ = ctx.cancelled() => Err(CapabilityError::Cancelled),
        }
    }
}

/// Register every built-in capability.
pub fn register_builtins(registry: &mut CapabilityRegistry) {
    registry.register(Arc::new(EchoCapability));
    registry.register(Arc::new(SleepCapability));
}
