use std::time::Duration;

use uuid::Uuid;

use crate::operation::{OperationKind, OperationState};
use crate::orchestration::{OrchestrationKind, OrchestrationState};

/// Outcome of a single step invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Retried(Duration),
    Failed,
}

/// A step finished one invocation.
#[derive(Debug, Clone)]
pub struct StepProcessed {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub step: String,
    pub outcome: StepOutcome,
}

/// An operation reached a terminal state.
#[derive(Debug, Clone)]
pub struct OperationFinished {
    pub operation_id: Uuid,
    pub instance_id: String,
    pub kind: OperationKind,
    pub state: OperationState,
}

/// An orchestration reached a terminal state.
#[derive(Debug, Clone)]
pub struct OrchestrationFinished {
    pub orchestration_id: Uuid,
    pub kind: OrchestrationKind,
    pub state: OrchestrationState,
}
