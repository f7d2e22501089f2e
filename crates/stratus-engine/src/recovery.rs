use std::sync::Arc;

use tracing::{info, instrument};

use stratus_core::{
    OperationFilter, OperationKind, OperationState, OrchestrationFilter, OrchestrationKind,
    OrchestrationState,
};
use stratus_storage::{OperationStore, OrchestrationStore};

use crate::error::EngineError;
use crate::queue::ProcessingQueue;

/// Reloads in-flight operations and orchestrations into the queues.
///
/// Runs synchronously at startup, before the HTTP surface begins serving.
/// The whole loader can be disabled for read-only replicas sharing a
/// production database.
pub struct RecoveryLoader {
    operations: Arc<dyn OperationStore>,
    orchestrations: Arc<dyn OrchestrationStore>,
}

impl RecoveryLoader {
    pub fn new(
        operations: Arc<dyn OperationStore>,
        orchestrations: Arc<dyn OrchestrationStore>,
    ) -> Self {
        Self {
            operations,
            orchestrations,
        }
    }

    /// Requeue every non-terminal operation of `kind`, oldest first.
    #[instrument(skip(self, queue))]
    pub async fn resume_operations(
        &self,
        kind: OperationKind,
        queue: &ProcessingQueue,
    ) -> Result<usize, EngineError> {
        let operations = self.operations.list_not_finished_by_kind(kind).await?;
        let mut resumed = 0;
        for operation in operations {
            if queue.add(operation.id) {
                info!(operation_id = %operation.id, "resumed operation");
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Requeue orchestrations of `kind`: canceling first, then in-progress,
    /// then pending, each batch oldest first.
    #[instrument(skip(self, queue))]
    pub async fn resume_orchestrations(
        &self,
        kind: OrchestrationKind,
        queue: &ProcessingQueue,
    ) -> Result<usize, EngineError> {
        let mut resumed = self.resume_canceling(kind, queue).await?;

        for state in [OrchestrationState::InProgress, OrchestrationState::Pending] {
            let orchestrations = self
                .orchestrations
                .list(OrchestrationFilter::with_kind_and_states(kind, [state]))
                .await?;
            for orchestration in orchestrations {
                if queue.add(orchestration.id) {
                    info!(orchestration_id = %orchestration.id, %state, "resumed orchestration");
                    resumed += 1;
                }
            }
        }
        Ok(resumed)
    }

    /// Requeue at most one canceling orchestration, and only if it still has
    /// in-progress children; the rest settle on the supervisor's next
    /// regular scan. Requeueing them all at boot would flood the queue.
    async fn resume_canceling(
        &self,
        kind: OrchestrationKind,
        queue: &ProcessingQueue,
    ) -> Result<usize, EngineError> {
        let canceling = self
            .orchestrations
            .list(OrchestrationFilter::with_kind_and_states(
                kind,
                [OrchestrationState::Canceling],
            ))
            .await?;

        for orchestration in canceling {
            let page = self
                .operations
                .list_by_orchestration(
                    orchestration.id,
                    OperationFilter::with_states([OperationState::InProgress]),
                )
                .await?;
            if page.in_progress_count > 0 {
                info!(orchestration_id = %orchestration.id, "resumed canceling orchestration");
                queue.add(orchestration.id);
                return Ok(1);
            }
        }
        Ok(0)
    }
}
