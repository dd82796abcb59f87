//! Capability abstraction module
//!
//! A capability is a named, contract-bound unit of work invoked by a step:
//! - Capability: the invocation trait implemented by file ops, code runs, fetches
//! - CapabilityMeta: input/output schema, approval rule and default timeout
//! - CapabilityRegistry: explicit name lookup, built once at startup
//! - InvocationContext: ids, cancellation and fan-out access handed to each call

mod context;
mod registry;
pub mod schema;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use context::InvocationContext;
pub use registry::CapabilityRegistry;

pub use tokio_util::sync::CancellationToken;

/// Default timeout applied when a capability declares none.
pub const DEFAULT_CAPABILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability trait - the single invocation interface for all work units.
///
/// Capabilities are black boxes to the scheduler. They should watch
/// `ctx.cancellation_token` at natural suspension points.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique capability name
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Contract consulted by the scheduler before and after invocation
    fn metadata(&self) -> CapabilityMeta {
        CapabilityMeta::new(self.name(), self.description())
    }

    /// Invoke with fully resolved arguments
    async fn invoke(&self, args: Value, ctx: InvocationContext) -> Result<Value, CapabilityError>;
}

/// Failure reported by a capability invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("unknown capability: {0}")]
    Unknown(String),
}

impl CapabilityError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Timeouts and transport errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

/// Whether invoking a capability needs a human decision first.
#[derive(Clone, Default)]
pub enum ApprovalRule {
    #[default]
    Never,
    Always,
    /// Evaluated against the resolved arguments of each invocation
    When(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl ApprovalRule {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::When(Arc::new(predicate))
    }

    pub fn requires_approval(&self, args: &Value) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::When(predicate) => predicate(args),
        }
    }
}

impl fmt::Debug for ApprovalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::When(_) => f.write_str("When(<predicate>)"),
        }
    }
}

/// Capability contract
#[derive(Debug, Clone)]
pub struct CapabilityMeta {
    pub name: String,
    pub description: String,
    /// JSON schema for the resolved argument object. Null disables the check.
    pub input_schema: Value,
    /// JSON schema for the produced value. Null disables the check.
    pub output_schema: Value,
    pub approval: ApprovalRule,
    pub timeout: Duration,
}

impl CapabilityMeta {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Null,
            output_schema: Value::Null,
            approval: ApprovalRule::Never,
            timeout: DEFAULT_CAPABILITY_TIMEOUT,
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_approval(mut self, approval: ApprovalRule) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
