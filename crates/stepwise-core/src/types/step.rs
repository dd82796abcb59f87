//! Step type definitions
//!
//! A Step is one capability invocation inside a Plan, with its prerequisites
//! and an argument bag that may reference the output of other steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Strongly-typed Step ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&StepId> for StepId {
    fn from(value: &StepId) -> Self {
        value.clone()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Lifecycle status of a step. Only the scheduler mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet evaluated by the scheduler
    Pending,
    /// Waiting on prerequisites that have not finished
    Blocked,
    /// All prerequisites satisfied, not yet dispatched
    Ready,
    /// Dispatched; capability invocation in progress
    Running,
    /// Running, but parked on the approval gate
    Suspended,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Completed, failed and skipped are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Running or suspended on approval.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Running | Self::Suspended)
    }

    /// Not started yet (pending, blocked or ready).
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Blocked | Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a step's failure or skip affects the rest of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure or skip cascades to dependents; unrelated branches continue
    #[default]
    Normal,
    /// Failure or approval denial aborts the whole run
    Critical,
    /// A skip counts as satisfied for dependents
    Optional,
}

/// Reference to the output of another step, optionally narrowed by a JSON pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRef {
    pub step: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

/// An argument value: either a literal or a reference to another step's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Literal(Value),
    Ref(StepRef),
}

impl ArgValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Whole output of `step`.
    pub fn output_of(step: impl Into<StepId>) -> Self {
        Self::Ref(StepRef {
            step: step.into(),
            pointer: None,
        })
    }

    /// Part of the output of `step` selected by a JSON pointer, e.g. `/files/0`.
    pub fn output_at(step: impl Into<StepId>, pointer: impl Into<String>) -> Self {
        Self::Ref(StepRef {
            step: step.into(),
            pointer: Some(pointer.into()),
        })
    }

    pub fn referenced_step(&self) -> Option<&StepId> {
        match self {
            Self::Ref(reference) => Some(&reference.step),
            Self::Literal(_) => None,
        }
    }
}

/// Named arguments of a step. Ordered so logs and hashes are stable.
pub type ArgBag = BTreeMap<String, ArgValue>;

/// A single step in the execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier for this step within its plan
    pub id: StepId,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Name of the capability to invoke
    pub capability: String,
    #[serde(default)]
    pub args: ArgBag,
    /// IDs of steps this step depends on
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Dispatch tie-break among equally ready steps; lower runs first.
    /// Filled from the plan position when absent.
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub criticality: Criticality,
    /// Overrides the capability's default timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Step {
    /// Create a step invoking `capability`
    pub fn new(id: impl Into<StepId>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            capability: capability.into(),
            args: ArgBag::new(),
            depends_on: Vec::new(),
            order: None,
            criticality: Criticality::Normal,
            timeout_ms: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: ArgValue) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<StepId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn critical(mut self) -> Self {
        self.criticality = Criticality::Critical;
        self
    }

    pub fn optional(mut self) -> Self {
        self.criticality = Criticality::Optional;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Steps referenced from the argument bag.
    pub fn referenced_steps(&self) -> impl Iterator<Item = &StepId> {
        self.args.values().filter_map(ArgValue::referenced_step)
    }
}
