//! The operation manager: drives one operation through its step pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use stratus_core::events::{OperationFinished, StepOutcome, StepProcessed};
use stratus_core::{Operation, OperationKind, OperationState};
use stratus_storage::{OperationStore, StoreError};

use crate::bus::{panic_message, EventBus};
use crate::error::EngineError;
use crate::queue::Executor;
use crate::registry::StepRegistry;
use crate::step::{Step, StepResult};

/// Wall-clock budget for a whole operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Drives a single operation to completion or permanent failure.
///
/// One manager exists per operation kind, sharing the store and the event
/// bus. `process` is safe to call concurrently for different ids; for the
/// same id the store's optimistic concurrency guarantees at most one worker
/// makes progress.
pub struct OperationManager {
    kind: OperationKind,
    store: Arc<dyn OperationStore>,
    registry: StepRegistry,
    bus: EventBus,
    operation_timeout: Duration,
}

/// Result of persisting one step outcome.
enum Invocation {
    /// The step completed and the walk continues.
    Advanced,
    /// The step asked to be re-run; release the worker.
    Requeue(Duration),
    /// The operation failed, was lost to another worker, or was canceled.
    Halted,
}

impl OperationManager {
    pub fn new(
        kind: OperationKind,
        store: Arc<dyn OperationStore>,
        bus: EventBus,
        registry: StepRegistry,
    ) -> Self {
        Self {
            kind,
            store,
            registry,
            bus,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    /// Process one operation.
    ///
    /// Returns `Ok(None)` when the manager is done with the id (terminal
    /// state reached, or the operation was lost to another worker) and
    /// `Ok(Some(delay))` when the current step asked to be re-run after
    /// `delay`.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn process(&self, operation_id: Uuid) -> Result<Option<Duration>, EngineError> {
        let mut operation = self.store.get(operation_id).await?;

        if operation.state.is_terminal() {
            debug!(state = %operation.state, "operation already in terminal state");
            return Ok(None);
        }

        if operation.state == OperationState::Pending {
            operation.state = OperationState::InProgress;
            operation.description = "operation in progress".to_string();
            operation.updated_at = Utc::now();
            operation = match self.store.update(operation).await {
                Ok(op) => op,
                Err(e) if e.is_conflict() => {
                    debug!("operation picked up by another worker");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            info!("operation started");
        }

        if self.timed_out(&operation) {
            self.fail_timed_out(operation).await?;
            return Ok(None);
        }

        if let Some(init) = self.registry.init() {
            match self.invoke(init, operation, false).await? {
                Invocation::Advanced => {}
                Invocation::Requeue(after) => return Ok(Some(after)),
                Invocation::Halted => return Ok(None),
            }
        }

        for descriptor in self.registry.steps() {
            // Reload between steps so out-of-band cancellation and the
            // previous step's persisted result are both observed.
            operation = self.store.get(operation_id).await?;

            if operation.state.is_terminal() {
                info!(state = %operation.state, "operation finished out of band");
                return Ok(None);
            }
            if operation.step_completed(descriptor.name()) {
                continue;
            }
            if descriptor.should_skip(&operation) {
                debug!(step = descriptor.name(), "step skipped");
                continue;
            }
            if self.timed_out(&operation) {
                self.fail_timed_out(operation).await?;
                return Ok(None);
            }

            match self.invoke(descriptor.step(), operation, true).await? {
                Invocation::Advanced => {}
                Invocation::Requeue(after) => return Ok(Some(after)),
                Invocation::Halted => return Ok(None),
            }
        }

        let mut operation = self.store.get(operation_id).await?;
        if operation.state.is_terminal() {
            return Ok(None);
        }
        operation.state = OperationState::Succeeded;
        operation.description = "operation succeeded".to_string();
        let now = Utc::now();
        operation.updated_at = now;
        operation.finished_at = Some(now);

        match self.store.update(operation).await {
            Ok(operation) => {
                info!("operation succeeded");
                self.bus.publish(OperationFinished {
                    operation_id: operation.id,
                    instance_id: operation.instance_id.clone(),
                    kind: self.kind,
                    state: operation.state,
                });
                Ok(None)
            }
            Err(e) if e.is_conflict() => {
                debug!("lost final update to another worker");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run one step and persist its outcome.
    ///
    /// `record_progress` is false for the init step, which re-runs on every
    /// dispatch and relies on its own idempotence instead of the progress
    /// map.
    async fn invoke(
        &self,
        step: Arc<dyn Step>,
        operation: Operation,
        record_progress: bool,
    ) -> Result<Invocation, EngineError> {
        let step_name = step.name().to_string();
        let operation_id = operation.id;
        debug!(step = %step_name, %operation_id, "running step");

        // The step runs on its own task so a panic is contained and can be
        // turned into a permanent failure.
        let handle = tokio::spawn(async move { step.run(operation).await });
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                error!(step = %step_name, %reason, "step panicked");
                self.bus.publish(StepProcessed {
                    operation_id,
                    kind: self.kind,
                    step: step_name.clone(),
                    outcome: StepOutcome::Failed,
                });
                let operation = self.store.get(operation_id).await?;
                if operation.state.is_terminal() {
                    return Ok(Invocation::Halted);
                }
                self.fail(operation, format!("step {step_name} panicked: {reason}"))
                    .await?;
                return Ok(Invocation::Halted);
            }
        };

        match result {
            StepResult::Completed(mut operation) => {
                if record_progress {
                    operation.progress.insert(step_name.clone(), Utc::now());
                    operation.description = format!("step {step_name} completed");
                }
                operation.updated_at = Utc::now();
                match self.store.update(operation).await {
                    Ok(_) => {
                        self.bus.publish(StepProcessed {
                            operation_id,
                            kind: self.kind,
                            step: step_name,
                            outcome: StepOutcome::Completed,
                        });
                        Ok(Invocation::Advanced)
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(step = %step_name, "lost operation to another worker");
                        Ok(Invocation::Halted)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            StepResult::Retry {
                mut operation,
                after,
            } => {
                operation.updated_at = Utc::now();
                match self.store.update(operation).await {
                    Ok(_) => {
                        info!(step = %step_name, retry_after = ?after, "step requested retry");
                        self.bus.publish(StepProcessed {
                            operation_id,
                            kind: self.kind,
                            step: step_name,
                            outcome: StepOutcome::Retried(after),
                        });
                        Ok(Invocation::Requeue(after))
                    }
                    Err(e) if e.is_conflict() => Ok(Invocation::Halted),
                    Err(e) => Err(e.into()),
                }
            }
            StepResult::Failed { operation, error } => {
                warn!(step = %step_name, %error, "step failed permanently");
                self.bus.publish(StepProcessed {
                    operation_id,
                    kind: self.kind,
                    step: step_name,
                    outcome: StepOutcome::Failed,
                });
                self.fail(operation, error.message).await?;
                Ok(Invocation::Halted)
            }
        }
    }

    async fn fail(&self, mut operation: Operation, reason: String) -> Result<(), EngineError> {
        operation.state = OperationState::Failed;
        operation.description = reason;
        let now = Utc::now();
        operation.updated_at = now;
        operation.finished_at = Some(now);

        match self.store.update(operation).await {
            Ok(operation) => {
                warn!(%operation.id, description = %operation.description, "operation failed");
                self.bus.publish(OperationFinished {
                    operation_id: operation.id,
                    instance_id: operation.instance_id.clone(),
                    kind: self.kind,
                    state: operation.state,
                });
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                debug!("lost failure update to another worker");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn timed_out(&self, operation: &Operation) -> bool {
        Utc::now()
            .signed_duration_since(operation.created_at)
            .to_std()
            .map(|elapsed| elapsed > self.operation_timeout)
            .unwrap_or(false)
    }

    async fn fail_timed_out(&self, operation: Operation) -> Result<(), EngineError> {
        let reason = format!(
            "operation exceeded timeout of {}s",
            self.operation_timeout.as_secs()
        );
        self.fail(operation, reason).await
    }
}

#[async_trait]
impl Executor for OperationManager {
    async fn execute(&self, id: Uuid) -> Result<Option<Duration>, EngineError> {
        self.process(id).await
    }
}
