//! Plan validation
//!
//! Plans arrive from an external planner and are re-checked before any step
//! runs. A rejected plan never starts.

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use crate::capability::CapabilityRegistry;
use crate::types::{Plan, StepId};

/// Structural errors: the plan is rejected before execution and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Empty plan")]
    EmptyPlan,

    #[error("Duplicate step ID: {0}")]
    DuplicateStepId(StepId),

    #[error("Missing dependency: step '{0}' depends on undefined step '{1}'")]
    MissingDependency(StepId, StepId),

    #[error("Step '{0}' depends on itself")]
    SelfDependency(StepId),

    #[error("Unknown capability '{1}' in step '{0}'")]
    UnknownCapability(StepId, String),

    #[error("Step '{0}' references output of undefined step '{1}'")]
    UnknownReference(StepId, StepId),

    #[error("Step '{0}' references output of '{1}' but does not depend on it")]
    ReferenceWithoutDependency(StepId, StepId),

    #[error("DAG contains cycle involving step: {0}")]
    CycleDetected(StepId),
}

/// Plan validator trait
pub trait PlanValidator: Send + Sync {
    fn validate(&self, plan: &Plan) -> Result<(), ValidationError>;
}

/// Built-in structural checks: non-empty, unique ids, resolvable dependencies
/// and references, known capabilities, acyclic.
#[derive(Debug, Default, Clone)]
pub struct StructuralValidator {
    /// Empty means capability names are not checked
    known_capabilities: HashSet<String>,
}

impl StructuralValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: &CapabilityRegistry) -> Self {
        Self {
            known_capabilities: registry.names().into_iter().collect(),
        }
    }
}

impl PlanValidator for StructuralValidator {
    fn validate(&self, plan: &Plan) -> Result<(), ValidationError> {
        if plan.is_empty() {
            return Err(ValidationError::EmptyPlan);
        }

        let mut ids = HashSet::with_capacity(plan.len());
        for step in &plan.steps {
            if !ids.insert(&step.id) {
                return Err(ValidationError::DuplicateStepId(step.id.clone()));
            }
        }

        for step in &plan.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(ValidationError::SelfDependency(step.id.clone()));
                }
                if !ids.contains(dep) {
                    return Err(ValidationError::MissingDependency(
                        step.id.clone(),
                        dep.clone(),
                    ));
                }
            }

            for referenced in step.referenced_steps() {
                if !ids.contains(referenced) {
                    return Err(ValidationError::UnknownReference(
                        step.id.clone(),
                        referenced.clone(),
                    ));
                }
                if !step.depends_on.contains(referenced) {
                    return Err(ValidationError::ReferenceWithoutDependency(
                        step.id.clone(),
                        referenced.clone(),
                    ));
                }
            }

            if !self.known_capabilities.is_empty()
                && !self.known_capabilities.contains(&step.capability)
            {
                return Err(ValidationError::UnknownCapability(
                    step.id.clone(),
                    step.capability.clone(),
                ));
            }
        }

        detect_cycle(plan)
    }
}

/// Kahn's algorithm; any step left unvisited sits on or behind a cycle.
fn detect_cycle(plan: &Plan) -> Result<(), ValidationError> {
    let mut in_degree: HashMap<&StepId, usize> = HashMap::with_capacity(plan.len());
    let mut dependents: HashMap<&StepId, Vec<&StepId>> = HashMap::new();
    for step in &plan.steps {
        in_degree.insert(&step.id, step.depends_on.len());
        for dep in &step.depends_on {
            dependents.entry(dep).or_default().push(&step.id);
        }
    }

    let mut queue: VecDeque<&StepId> = plan
        .steps
        .iter()
        .filter(|step| step.depends_on.is_empty())
        .map(|step| &step.id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if visited == plan.len() {
        return Ok(());
    }
    let stuck = plan
        .steps
        .iter()
        .find(|step| in_degree.get(&step.id).copied().unwrap_or(0) > 0)
        .map(|step| step.id.clone())
        .unwrap_or_default();
    Err(ValidationError::CycleDetected(stuck))
}
