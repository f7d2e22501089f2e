use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use stratus_core::{Operation, OperationPayload};
use stratus_engine::{Step, StepResult};

use crate::clients::ProvisionerClient;

use super::{client_failure, poll_provisioner, CHECK_INTERVAL, RETRY_INTERVAL};

/// Applies changed instance parameters through the provisioner.
pub struct ApplyParametersStep {
    provisioner: Arc<dyn ProvisionerClient>,
    check_interval: Duration,
}

impl ApplyParametersStep {
    pub fn new(provisioner: Arc<dyn ProvisionerClient>) -> Self {
        Self {
            provisioner,
            check_interval: CHECK_INTERVAL,
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }
}

#[async_trait]
impl Step for ApplyParametersStep {
    fn name(&self) -> &str {
        "apply_parameters"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::Update(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "apply_parameters requires an update payload");
        };

        match &payload.provisioner_operation_id {
            None => {
                let instance_id = operation.instance_id.clone();
                let parameters = payload.new_parameters.clone();
                match self
                    .provisioner
                    .update_runtime(&instance_id, &parameters)
                    .await
                {
                    Ok(provisioner_operation_id) => {
                        payload.provisioner_operation_id = Some(provisioner_operation_id);
                        StepResult::retry(operation, self.check_interval)
                    }
                    Err(error) => client_failure(operation, error, RETRY_INTERVAL),
                }
            }
            Some(provisioner_operation_id) => {
                let provisioner_operation_id = provisioner_operation_id.clone();
                poll_provisioner(
                    self.provisioner.as_ref(),
                    &provisioner_operation_id,
                    operation,
                    self.check_interval,
                    "parameter update",
                )
                .await
            }
        }
    }
}
