//! Step graph owned by a single run
//!
//! Tracks status and result per step and enforces the allowed transitions.
//! Only the scheduler loop holds a StepGraph; nothing else mutates it.

use std::collections::HashMap;
use thiserror::Error;

use crate::types::{
    Criticality, ErrorKind, Plan, Step, StepId, StepReport, StepResult, StepStatus,
    BLOCKED_BY_FAILED, BLOCKED_BY_SKIPPED,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("unknown step '{0}'")]
    UnknownStep(StepId),
    #[error("step '{step}' cannot move from {from} to {to}")]
    Illegal {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },
}

/// Whether `from -> to` is a legal status change.
pub fn transition_allowed(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
        (from, to),
        (Pending, Blocked | Ready | Skipped)
            | (Blocked, Ready | Skipped)
            | (Ready, Running | Skipped)
            | (Running, Suspended | Completed | Failed | Skipped)
            | (Suspended, Running | Failed | Skipped)
    )
}

/// A step with its runtime state
#[derive(Debug, Clone)]
pub struct StepNode {
    pub step: Step,
    /// Position in the plan
    pub position: usize,
    /// Effective dispatch order
    pub order: u32,
    pub status: StepStatus,
    pub result: Option<StepResult>,
}

/// A status change made while settling the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub step_id: StepId,
    pub status: StepStatus,
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct StepGraph {
    nodes: HashMap<StepId, StepNode>,
    /// Step ids in plan order
    ids: Vec<StepId>,
}

impl StepGraph {
    pub fn from_plan(plan: &Plan) -> Self {
        let mut nodes = HashMap::with_capacity(plan.len());
        let mut ids = Vec::with_capacity(plan.len());
        for (position, step) in plan.steps.iter().enumerate() {
            ids.push(step.id.clone());
            nodes.insert(
                step.id.clone(),
                StepNode {
                    step: step.clone(),
                    position,
                    order: plan.order_of(position),
                    status: StepStatus::Pending,
                    result: None,
                },
            );
        }
        Self { nodes, ids }
    }

    pub fn node(&self, id: &StepId) -> Option<&StepNode> {
        self.nodes.get(id)
    }

    pub fn status(&self, id: &StepId) -> Option<StepStatus> {
        self.nodes.get(id).map(|node| node.status)
    }

    /// Move a step to `to`, returning the previous status.
    pub fn transition(&mut self, id: &StepId, to: StepStatus) -> Result<StepStatus, TransitionError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| TransitionError::UnknownStep(id.clone()))?;
        let from = node.status;
        if !transition_allowed(from, to) {
            return Err(TransitionError::Illegal {
                step: id.clone(),
                from,
                to,
            });
        }
        node.status = to;
        Ok(from)
    }

    /// Move a step to a terminal status and record its result.
    pub fn finish(
        &mut self,
        id: &StepId,
        to: StepStatus,
        result: StepResult,
    ) -> Result<StepStatus, TransitionError> {
        debug_assert!(to.is_terminal());
        let from = self.transition(id, to)?;
        if let Some(node) = self.nodes.get_mut(id) {
            node.result = Some(result);
        }
        Ok(from)
    }

    /// Promote steps whose prerequisites are settled and cascade skips from
    /// failed or skipped prerequisites, until nothing changes.
    pub fn settle(&mut self) -> Vec<Transition> {
        let mut changes = Vec::new();
        loop {
            let mut changed = false;
            for index in 0..self.ids.len() {
                let id = self.ids[index].clone();
                let Some(status) = self.status(&id) else {
                    continue;
                };
                if !matches!(status, StepStatus::Pending | StepStatus::Blocked) {
                    continue;
                }
                let next = match self.prerequisite_state(&id) {
                    Prerequisites::Satisfied => Some((StepStatus::Ready, None)),
                    Prerequisites::Broken(reason) => Some((StepStatus::Skipped, Some(reason))),
                    Prerequisites::Waiting if status == StepStatus::Pending => {
                        Some((StepStatus::Blocked, None))
                    }
                    Prerequisites::Waiting => None,
                };
                let Some((to, reason)) = next else {
                    continue;
                };
                let applied = match reason {
                    Some(reason) => self
                        .finish(&id, to, StepResult::not_run(ErrorKind::Dependency, reason))
                        .is_ok(),
                    None => self.transition(&id, to).is_ok(),
                };
                if applied {
                    changed = true;
                    changes.push(Transition {
                        step_id: id,
                        status: to,
                        reason,
                    });
                }
            }
            if !changed {
                return changes;
            }
        }
    }

    fn prerequisite_state(&self, id: &StepId) -> Prerequisites {
        let Some(node) = self.nodes.get(id) else {
            return Prerequisites::Waiting;
        };
        let mut waiting = false;
        for dep in &node.step.depends_on {
            let Some(dep_node) = self.nodes.get(dep) else {
                waiting = true;
                continue;
            };
            match dep_node.status {
                StepStatus::Completed => {}
                StepStatus::Failed => return Prerequisites::Broken(BLOCKED_BY_FAILED),
                StepStatus::Skipped if dep_node.step.criticality == Criticality::Optional => {}
                StepStatus::Skipped => return Prerequisites::Broken(BLOCKED_BY_SKIPPED),
                _ => waiting = true,
            }
        }
        if waiting {
            Prerequisites::Waiting
        } else {
            Prerequisites::Satisfied
        }
    }

    /// Ready steps by (order, plan position).
    pub fn ready(&self) -> Vec<StepId> {
        let mut ready: Vec<&StepNode> = self
            .nodes
            .values()
            .filter(|node| node.status == StepStatus::Ready)
            .collect();
        ready.sort_by_key(|node| (node.order, node.position));
        ready.into_iter().map(|node| node.step.id.clone()).collect()
    }

    /// Steps not yet started, in plan order.
    pub fn not_started(&self) -> Vec<StepId> {
        self.ids_where(StepStatus::is_waiting)
    }

    /// Running or suspended steps, in plan order.
    pub fn in_flight(&self) -> Vec<StepId> {
        self.ids_where(StepStatus::is_in_flight)
    }

    pub fn is_finished(&self) -> bool {
        self.nodes.values().all(|node| node.status.is_terminal())
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.nodes
            .values()
            .filter(|node| node.status == status)
            .count()
    }

    /// Final reports, in plan order.
    pub fn reports(&self) -> Vec<StepReport> {
        self.ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|node| StepReport {
                step_id: node.step.id.clone(),
                capability: node.step.capability.clone(),
                status: node.status,
                result: node.result.clone(),
            })
            .collect()
    }

    fn ids_where(&self, predicate: impl Fn(&StepStatus) -> bool) -> Vec<StepId> {
        self.ids
            .iter()
            .filter(|id| self.status(id).map_or(false, |status| predicate(&status)))
            .cloned()
            .collect()
    }
}

enum Prerequisites {
    Satisfied,
    Waiting,
    Broken(&'static str),
}
