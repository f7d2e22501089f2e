use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use stratus_core::{Operation, PlanId};

/// Permanent step failure.
///
/// Returning one of these fails the whole operation; transient trouble must
/// be reported through [`StepResult::Retry`] instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outcome of one step invocation.
#[derive(Debug)]
pub enum StepResult {
    /// The step is done; the manager records it in the progress map and
    /// advances.
    Completed(Operation),

    /// Not done yet; the manager persists the operation and reschedules it
    /// after at least `after`.
    Retry { operation: Operation, after: Duration },

    /// Permanent failure; the manager persists the operation as failed with
    /// the error message as its description.
    Failed {
        operation: Operation,
        error: StepError,
    },
}

impl StepResult {
    pub fn completed(operation: Operation) -> Self {
        Self::Completed(operation)
    }

    pub fn retry(operation: Operation, after: Duration) -> Self {
        Self::Retry { operation, after }
    }

    pub fn failed(operation: Operation, message: impl Into<String>) -> Self {
        Self::Failed {
            operation,
            error: StepError::new(message),
        }
    }
}

/// A single unit of work inside an operation.
///
/// Steps must be idempotent: check the operation's payload before repeating
/// an external side effect, and tolerate re-invocation after a crash between
/// the side effect and the persistence of the result. Steps never mutate the
/// operation's `state` field; only the manager transitions states.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Stable name, used as the key in the operation's progress map.
    fn name(&self) -> &str;

    async fn run(&self, operation: Operation) -> StepResult;
}

/// Skips the inner step for operations whose plan is in the configured set.
pub struct SkipForPlan<S> {
    inner: S,
    plans: Vec<PlanId>,
}

impl<S: Step> SkipForPlan<S> {
    pub fn new(inner: S, plans: impl Into<Vec<PlanId>>) -> Self {
        Self {
            inner,
            plans: plans.into(),
        }
    }

    /// Skip for trial instances, the common case.
    pub fn trial(inner: S) -> Self {
        Self::new(inner, [PlanId::Trial])
    }
}

#[async_trait]
impl<S: Step> Step for SkipForPlan<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if self.plans.contains(&operation.plan()) {
            debug!(step = self.inner.name(), plan = %operation.plan(), "skipping step for plan");
            return StepResult::Completed(operation);
        }
        self.inner.run(operation).await
    }
}

/// Runs the inner step only for operations whose plan is in the configured
/// set; completes immediately otherwise.
pub struct EnableForPlan<S> {
    inner: S,
    plans: Vec<PlanId>,
}

impl<S: Step> EnableForPlan<S> {
    pub fn new(inner: S, plans: impl Into<Vec<PlanId>>) -> Self {
        Self {
            inner,
            plans: plans.into(),
        }
    }
}

#[async_trait]
impl<S: Step> Step for EnableForPlan<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if !self.plans.contains(&operation.plan()) {
            debug!(step = self.inner.name(), plan = %operation.plan(), "step not enabled for plan");
            return StepResult::Completed(operation);
        }
        self.inner.run(operation).await
    }
}
