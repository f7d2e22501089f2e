use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use stratus_core::{Operation, OperationPayload};
use stratus_engine::{Step, StepResult};

use crate::clients::ProvisionerClient;

use super::{client_failure, poll_provisioner, CHECK_INTERVAL, RETRY_INTERVAL};

/// Moves one runtime to the campaign's target version.
pub struct UpgradeRuntimeStep {
    provisioner: Arc<dyn ProvisionerClient>,
    check_interval: Duration,
}

impl UpgradeRuntimeStep {
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
impl Step for UpgradeRuntimeStep {
    fn name(&self) -> &str {
        "upgrade_runtime"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::UpgradeRuntime(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "upgrade_runtime requires an upgrade payload");
        };

        match &payload.provisioner_operation_id {
            None => {
                let runtime_id = payload.runtime.runtime_id.clone();
                let target_version = payload.target_version.clone();
                match self
                    .provisioner
                    .upgrade_runtime(&runtime_id, &target_version)
                    .await
                {
                    Ok(provisioner_operation_id) => {
                        info!(%runtime_id, %target_version, "upgrade accepted");
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
                    "runtime upgrade",
                )
                .await
            }
        }
    }
}

/// Upgrades the underlying cluster without touching the runtime components.
pub struct UpgradeClusterStep {
    provisioner: Arc<dyn ProvisionerClient>,
    check_interval: Duration,
}

impl UpgradeClusterStep {
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
impl Step for UpgradeClusterStep {
    fn name(&self) -> &str {
        "upgrade_cluster"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::UpgradeCluster(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "upgrade_cluster requires an upgrade payload");
        };

        match &payload.provisioner_operation_id {
            None => {
                let runtime_id = payload.runtime.runtime_id.clone();
                match self.provisioner.upgrade_cluster(&runtime_id).await {
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
                    "cluster upgrade",
                )
                .await
            }
        }
    }
}
