//! Plan type definitions
//!
//! A Plan is the versioned step graph produced by the external planner.

use serde::{Deserialize, Serialize};

use super::{Step, StepId, TaskId};

/// Versioned DAG of steps for one task.
///
/// Accepted plans are never edited in place: `revise` yields version N+1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: TaskId,
    #[serde(default = "first_version")]
    pub version: u32,
    /// Goal the planner was asked to achieve
    #[serde(default)]
    pub goal: String,
    pub steps: Vec<Step>,
}

fn first_version() -> u32 {
    1
}

impl Plan {
    /// Create version 1 of a plan
    pub fn new(task_id: impl Into<TaskId>, goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            task_id: task_id.into(),
            version: first_version(),
            goal: goal.into(),
            steps,
        }
    }

    /// Produce the next version with a replacement step list.
    pub fn revise(&self, steps: Vec<Step>) -> Self {
        Self {
            task_id: self.task_id.clone(),
            version: self.version.saturating_add(1),
            goal: self.goal.clone(),
            steps,
        }
    }

    pub fn get_step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|step| &step.id == id)
    }

    /// Effective dispatch order of the step at `position`.
    pub fn order_of(&self, position: usize) -> u32 {
        self.steps
            .get(position)
            .and_then(|step| step.order)
            .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
