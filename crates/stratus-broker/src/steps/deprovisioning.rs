use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use stratus_core::{Operation, OperationPayload};
use stratus_engine::{Step, StepResult};

use crate::clients::{AccountProvider, EvaluationClient, ProvisionerClient};

use super::{client_failure, poll_provisioner, CHECK_INTERVAL, RETRY_INTERVAL};

/// Removes the instance's availability evaluations.
pub struct RemoveEvaluationsStep {
    evaluations: Arc<dyn EvaluationClient>,
}

impl RemoveEvaluationsStep {
    pub fn new(evaluations: Arc<dyn EvaluationClient>) -> Self {
        Self { evaluations }
    }
}

#[async_trait]
impl Step for RemoveEvaluationsStep {
    fn name(&self) -> &str {
        "remove_evaluations"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::Deprovision(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "remove_evaluations requires a deprovision payload");
        };
        if payload.evaluation_removed {
            return StepResult::Completed(operation);
        }

        let instance_id = operation.instance_id.clone();
        match self.evaluations.remove_evaluations(&instance_id).await {
            Ok(()) => {
                payload.evaluation_removed = true;
                StepResult::Completed(operation)
            }
            Err(error) => client_failure(operation, error, RETRY_INTERVAL),
        }
    }
}

/// Hands the hyperscaler credentials back to the pool.
pub struct ReleaseCredentialsStep {
    accounts: Arc<dyn AccountProvider>,
}

impl ReleaseCredentialsStep {
    pub fn new(accounts: Arc<dyn AccountProvider>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl Step for ReleaseCredentialsStep {
    fn name(&self) -> &str {
        "release_credentials"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::Deprovision(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "release_credentials requires a deprovision payload");
        };
        if payload.credentials_released {
            return StepResult::Completed(operation);
        }

        let instance_id = operation.instance_id.clone();
        match self.accounts.release_credentials(&instance_id).await {
            Ok(()) => {
                payload.credentials_released = true;
                StepResult::Completed(operation)
            }
            Err(error) => client_failure(operation, error, RETRY_INTERVAL),
        }
    }
}

/// Tears the cluster down and waits for the provisioner to finish.
pub struct RemoveRuntimeStep {
    provisioner: Arc<dyn ProvisionerClient>,
    check_interval: Duration,
}

impl RemoveRuntimeStep {
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
impl Step for RemoveRuntimeStep {
    fn name(&self) -> &str {
        "remove_runtime"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::Deprovision(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "remove_runtime requires a deprovision payload");
        };

        let Some(runtime_id) = payload.runtime_id.clone() else {
            // The instance never got a runtime; nothing to tear down.
            info!("no runtime recorded for instance; skipping removal");
            return StepResult::Completed(operation);
        };

        match &payload.provisioner_operation_id {
            None => match self.provisioner.deprovision_runtime(&runtime_id).await {
                Ok(provisioner_operation_id) => {
                    payload.provisioner_operation_id = Some(provisioner_operation_id);
                    StepResult::retry(operation, self.check_interval)
                }
                Err(error) => client_failure(operation, error, RETRY_INTERVAL),
            },
            Some(provisioner_operation_id) => {
                let provisioner_operation_id = provisioner_operation_id.clone();
                poll_provisioner(
                    self.provisioner.as_ref(),
                    &provisioner_operation_id,
                    operation,
                    self.check_interval,
                    "runtime removal",
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::PlanId;

    use crate::clients::{ClientError, ProvisionerResponse, ProvisionerStatus};
    use stratus_core::ProvisioningParameters;

    struct NoRuntimeProvisioner;

    #[async_trait]
    impl ProvisionerClient for NoRuntimeProvisioner {
        async fn provision_runtime(
            &self,
            _instance_id: &str,
            _parameters: &ProvisioningParameters,
            _runtime_version: &str,
        ) -> Result<ProvisionerResponse, ClientError> {
            unimplemented!()
        }

        async fn deprovision_runtime(&self, _runtime_id: &str) -> Result<String, ClientError> {
            panic!("deprovision must not be called without a runtime id");
        }

        async fn upgrade_runtime(
            &self,
            _runtime_id: &str,
            _target_version: &str,
        ) -> Result<String, ClientError> {
            unimplemented!()
        }

        async fn upgrade_cluster(&self, _runtime_id: &str) -> Result<String, ClientError> {
            unimplemented!()
        }

        async fn update_runtime(
            &self,
            _runtime_id: &str,
            _parameters: &serde_json::Value,
        ) -> Result<String, ClientError> {
            unimplemented!()
        }

        async fn operation_status(
            &self,
            _provisioner_operation_id: &str,
        ) -> Result<ProvisionerStatus, ClientError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_removal_without_a_runtime_completes_immediately() {
        let step = RemoveRuntimeStep::new(Arc::new(NoRuntimeProvisioner));
        let operation = Operation::new_deprovision("inst-1", PlanId::Standard, None);

        let result = step.run(operation).await;
        assert!(matches!(result, StepResult::Completed(_)));
    }
}
