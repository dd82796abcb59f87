//! Execution context: produced values of one plan execution
//!
//! Owned by the scheduler for the duration of a run and discarded afterwards.
//! Each step may write its value once.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::types::{ArgBag, ArgValue, Plan, StepId, StepRef};

/// Reference resolution failure. Fails the referencing step without retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("argument '{arg}' references unknown step '{step}'")]
    UnknownStep { arg: String, step: StepId },
    #[error("argument '{arg}' references step '{step}' which has not completed")]
    NotCompleted { arg: String, step: StepId },
    #[error("argument '{arg}': pointer '{pointer}' not found in output of step '{step}'")]
    PointerNotFound {
        arg: String,
        step: StepId,
        pointer: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("output of step '{0}' already recorded")]
    AlreadyWritten(StepId),
    #[error("step '{0}' is not part of this plan")]
    UnknownStep(StepId),
}

/// Write-once mapping from step id to produced value.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    steps: HashSet<StepId>,
    outputs: HashMap<StepId, Value>,
}

impl ExecutionContext {
    /// Empty context scoped to the steps of `plan`
    pub fn for_plan(plan: &Plan) -> Self {
        Self {
            steps: plan.steps.iter().map(|step| step.id.clone()).collect(),
            outputs: HashMap::new(),
        }
    }

    pub fn insert(&mut self, step: StepId, value: Value) -> Result<(), ContextError> {
        if !self.steps.contains(&step) {
            return Err(ContextError::UnknownStep(step));
        }
        if self.outputs.contains_key(&step) {
            return Err(ContextError::AlreadyWritten(step));
        }
        self.outputs.insert(step, value);
        Ok(())
    }

    pub fn get(&self, step: &StepId) -> Option<&Value> {
        self.outputs.get(step)
    }

    pub fn contains(&self, step: &StepId) -> bool {
        self.outputs.contains_key(step)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Resolve an argument bag into a JSON object of concrete values.
    pub fn resolve(&self, args: &ArgBag) -> Result<Value, ResolveError> {
        let mut resolved = Map::with_capacity(args.len());
        for (name, arg) in args {
            let value = match arg {
                ArgValue::Literal(value) => value.clone(),
                ArgValue::Ref(reference) => self.resolve_ref(name, reference)?,
            };
            resolved.insert(name.clone(), value);
        }
        Ok(Value::Object(resolved))
    }

    fn resolve_ref(&self, arg: &str, reference: &StepRef) -> Result<Value, ResolveError> {
        let step = &reference.step;
        if !self.steps.contains(step) {
            return Err(ResolveError::UnknownStep {
                arg: arg.to_string(),
                step: step.clone(),
            });
        }
        let output = self.outputs.get(step).ok_or_else(|| ResolveError::NotCompleted {
            arg: arg.to_string(),
            step: step.clone(),
        })?;
        match reference.pointer.as_deref() {
            None | Some("") => Ok(output.clone()),
            Some(pointer) => {
                output
                    .pointer(pointer)
                    .cloned()
                    .ok_or_else(|| ResolveError::PointerNotFound {
                        arg: arg.to_string(),
                        step: step.clone(),
                        pointer: pointer.to_string(),
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Step;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let plan = Plan::new(
            "task-1",
            "",
            vec![Step::new("list", "list_directory"), Step::new("resize", "resize")],
        );
        let mut ctx = ExecutionContext::for_plan(&plan);
        ctx.insert("list".into(), json!({"files": ["a.jpg", "b.jpg"]}))
            .unwrap();
        ctx
    }

    #[test]
    fn test_values_are_write_once() {
        let mut ctx = context();
        let err = ctx.insert("list".into(), json!(null)).unwrap_err();
        assert_eq!(err, ContextError::AlreadyWritten("list".into()));
        assert_eq!(ctx.get(&"list".into()).unwrap()["files"][0], json!("a.jpg"));
    }

    #[test]
    fn test_resolves_literals_refs_and_pointers() {
        let ctx = context();
        let mut args = ArgBag::new();
        args.insert("quality".into(), ArgValue::literal(80));
        args.insert("all".into(), ArgValue::output_of("list"));
        args.insert("first".into(), ArgValue::output_at("list", "/files/1"));

        let resolved = ctx.resolve(&args).unwrap();
        assert_eq!(resolved["quality"], json!(80));
        assert_eq!(resolved["all"]["files"].as_array().unwrap().len(), 2);
        assert_eq!(resolved["first"], json!("b.jpg"));
    }

    #[test]
    fn test_unresolved_references_are_typed_errors() {
        let ctx = context();

        let mut args = ArgBag::new();
        args.insert("x".into(), ArgValue::output_of("resize"));
        assert!(matches!(
            ctx.resolve(&args),
            Err(ResolveError::NotCompleted { .. })
        ));

        args.insert("x".into(), ArgValue::output_of("ghost"));
        assert!(matches!(
            ctx.resolve(&args),
            Err(ResolveError::UnknownStep { .. })
        ));

        args.insert("x".into(), ArgValue::output_at("list", "/files/9"));
        let err = ctx.resolve(&args).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument 'x': pointer '/files/9' not found in output of step 'list'"
        );
    }
}
