use async_trait::async_trait;

use stratus_core::{Operation, OperationPayload};
use stratus_engine::{Step, StepResult};

/// Runs on every dispatch before the weighted steps.
///
/// Stamps the default runtime version into provision payloads that carry
/// none. Idempotent by construction; it is never recorded in the progress
/// map.
pub struct InitializeStep {
    default_runtime_version: String,
}

impl InitializeStep {
    pub fn new(default_runtime_version: impl Into<String>) -> Self {
        Self {
            default_runtime_version: default_runtime_version.into(),
        }
    }
}

#[async_trait]
impl Step for InitializeStep {
    fn name(&self) -> &str {
        "initialize"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        if let OperationPayload::Provision(payload) = &mut operation.payload {
            if payload.runtime_version.is_none() {
                payload.runtime_version = Some(self.default_runtime_version.clone());
            }
        }
        StepResult::Completed(operation)
    }
}
