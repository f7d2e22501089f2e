use std::sync::Arc;

use stratus_core::Operation;

use crate::step::Step;

type SkipPredicate = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// A registered step: its weight, the step itself, and an optional skip
/// predicate evaluated against the operation on every dispatch.
pub struct StepDescriptor {
    weight: u32,
    step: Arc<dyn Step>,
    skip: Option<SkipPredicate>,
}

impl StepDescriptor {
    pub fn name(&self) -> &str {
        self.step.name()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn step(&self) -> Arc<dyn Step> {
        Arc::clone(&self.step)
    }

    pub fn should_skip(&self, operation: &Operation) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(operation))
    }
}

/// Ordered list of steps for one operation kind.
///
/// Lower weight runs strictly before higher weight; steps of equal weight
/// keep their registration order. The optional init step is a distinguished
/// pre-step executed on every dispatch.
#[derive(Default)]
pub struct StepRegistry {
    init: Option<Arc<dyn Step>>,
    steps: Vec<StepDescriptor>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_init<S: Step>(&mut self, step: S) {
        self.init = Some(Arc::new(step));
    }

    pub fn add_step<S: Step>(&mut self, weight: u32, step: S) {
        self.push(StepDescriptor {
            weight,
            step: Arc::new(step),
            skip: None,
        });
    }

    /// Register a step that is skipped whenever the predicate holds for the
    /// operation being processed.
    pub fn add_step_when<S, F>(&mut self, weight: u32, step: S, skip: F)
    where
        S: Step,
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        self.push(StepDescriptor {
            weight,
            step: Arc::new(step),
            skip: Some(Arc::new(skip)),
        });
    }

    fn push(&mut self, descriptor: StepDescriptor) {
        self.steps.push(descriptor);
        // Stable sort keeps registration order within one weight.
        self.steps.sort_by_key(|d| d.weight);
    }

    pub fn init(&self) -> Option<Arc<dyn Step>> {
        self.init.as_ref().map(Arc::clone)
    }

    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::step::StepResult;

    struct NamedStep(&'static str);

    #[async_trait]
    impl Step for NamedStep {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, operation: Operation) -> StepResult {
            StepResult::Completed(operation)
        }
    }

    #[test]
    fn test_steps_are_ordered_by_weight_then_registration() {
        let mut registry = StepRegistry::new();
        registry.add_step(10, NamedStep("create"));
        registry.add_step(2, NamedStep("credentials"));
        registry.add_step(2, NamedStep("evaluation"));
        registry.add_step(1, NamedStep("offering"));

        let names: Vec<&str> = registry.steps().iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["offering", "credentials", "evaluation", "create"]);
    }

    #[test]
    fn test_skip_predicate_is_consulted() {
        let mut registry = StepRegistry::new();
        registry.add_step_when(1, NamedStep("gated"), |op| op.plan().is_trial());

        let trial = Operation::new_deprovision("inst", stratus_core::PlanId::Trial, None);
        let standard = Operation::new_deprovision("inst", stratus_core::PlanId::Standard, None);

        assert!(registry.steps()[0].should_skip(&trial));
        assert!(!registry.steps()[0].should_skip(&standard));
    }
}
