use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use stratus_core::{Operation, OperationPayload};
use stratus_engine::{Step, StepResult};

use crate::clients::{AccountProvider, EvaluationClient, ProvisionerClient};

use super::{client_failure, poll_provisioner, CHECK_INTERVAL, RETRY_INTERVAL};

/// Resolves hyperscaler credentials from the account pool.
pub struct ResolveCredentialsStep {
    accounts: Arc<dyn AccountProvider>,
}

impl ResolveCredentialsStep {
    pub fn new(accounts: Arc<dyn AccountProvider>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl Step for ResolveCredentialsStep {
    fn name(&self) -> &str {
        "resolve_credentials"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::Provision(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "resolve_credentials requires a provision payload");
        };
        if payload.credentials.is_some() {
            return StepResult::Completed(operation);
        }

        let plan = payload.parameters.plan;
        let region = payload.parameters.region.clone();
        match self.accounts.credentials_for(plan, &region).await {
            Ok(credentials) => {
                info!(account = %credentials.provider_account_id, "credentials resolved");
                payload.credentials = Some(credentials);
                StepResult::Completed(operation)
            }
            Err(error) => client_failure(operation, error, RETRY_INTERVAL),
        }
    }
}

/// Creates the external availability evaluation for the instance.
pub struct ExternalEvaluationStep {
    evaluations: Arc<dyn EvaluationClient>,
}

impl ExternalEvaluationStep {
    pub fn new(evaluations: Arc<dyn EvaluationClient>) -> Self {
        Self { evaluations }
    }
}

#[async_trait]
impl Step for ExternalEvaluationStep {
    fn name(&self) -> &str {
        "external_evaluation"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::Provision(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "external_evaluation requires a provision payload");
        };
        if payload.evaluation_id.is_some() {
            return StepResult::Completed(operation);
        }

        let instance_id = operation.instance_id.clone();
        match self.evaluations.create_evaluation(&instance_id).await {
            Ok(evaluation_id) => {
                payload.evaluation_id = Some(evaluation_id);
                StepResult::Completed(operation)
            }
            Err(error) => client_failure(operation, error, RETRY_INTERVAL),
        }
    }
}

/// Stamps the audit-log tenant into the payload so the created runtime ships
/// its audit trail to the right collector. Skipped for trial plans via a
/// wrapper at wiring time.
pub struct AuditLogStep {
    tenant: String,
}

impl AuditLogStep {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
        }
    }
}

#[async_trait]
impl Step for AuditLogStep {
    fn name(&self) -> &str {
        "audit_log_overrides"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::Provision(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "audit_log_overrides requires a provision payload");
        };
        if payload.audit_log_tenant.is_none() {
            payload.audit_log_tenant = Some(self.tenant.clone());
        }
        StepResult::Completed(operation)
    }
}

/// Asks the provisioner for a cluster and waits for it to come up.
pub struct CreateRuntimeStep {
    provisioner: Arc<dyn ProvisionerClient>,
    check_interval: Duration,
}

impl CreateRuntimeStep {
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
impl Step for CreateRuntimeStep {
    fn name(&self) -> &str {
        "create_runtime"
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let OperationPayload::Provision(payload) = &mut operation.payload else {
            return StepResult::failed(operation, "create_runtime requires a provision payload");
        };

        match &payload.provisioner_operation_id {
            None => {
                let instance_id = operation.instance_id.clone();
                let parameters = payload.parameters.clone();
                let version = payload.runtime_version.clone().unwrap_or_default();
                match self
                    .provisioner
                    .provision_runtime(&instance_id, &parameters, &version)
                    .await
                {
                    Ok(response) => {
                        info!(runtime_id = %response.runtime_id, "provisioner accepted the runtime");
                        payload.runtime_id = Some(response.runtime_id);
                        payload.provisioner_operation_id = Some(response.operation_id);
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
                    "runtime provisioning",
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stratus_core::{CredentialsRef, PlanId, ProvisioningParameters};

    use crate::clients::{ClientError, ProvisionerResponse, ProvisionerStatus};

    fn provision_operation() -> Operation {
        Operation::new_provision(
            "inst-1",
            ProvisioningParameters {
                plan: PlanId::Standard,
                region: "westeurope".into(),
                platform_region: None,
                parameters: serde_json::json!({}),
            },
        )
    }

    struct FakeAccounts {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AccountProvider for FakeAccounts {
        async fn credentials_for(
            &self,
            _plan: PlanId,
            _region: &str,
        ) -> Result<CredentialsRef, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CredentialsRef {
                provider_account_id: "acct-7".into(),
                secret_name: "secret-7".into(),
            })
        }

        async fn release_credentials(&self, _instance_id: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_credentials_are_resolved_once() {
        let accounts = Arc::new(FakeAccounts {
            calls: AtomicUsize::new(0),
        });
        let step = ResolveCredentialsStep::new(accounts.clone());

        let StepResult::Completed(operation) = step.run(provision_operation()).await else {
            panic!("expected completion");
        };
        // Re-running against the persisted payload must not call out again.
        let StepResult::Completed(operation) = step.run(operation).await else {
            panic!("expected completion");
        };

        let OperationPayload::Provision(payload) = &operation.payload else {
            unreachable!()
        };
        assert!(payload.credentials.is_some());
        assert_eq!(accounts.calls.load(Ordering::SeqCst), 1);
    }

    struct TwoPhaseProvisioner {
        provision_calls: AtomicUsize,
        status_calls: AtomicUsize,
    }

    #[async_trait]
    impl ProvisionerClient for TwoPhaseProvisioner {
        async fn provision_runtime(
            &self,
            _instance_id: &str,
            _parameters: &ProvisioningParameters,
            _runtime_version: &str,
        ) -> Result<ProvisionerResponse, ClientError> {
            self.provision_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProvisionerResponse {
                operation_id: "prov-op-1".into(),
                runtime_id: "runtime-1".into(),
            })
        }

        async fn deprovision_runtime(&self, _runtime_id: &str) -> Result<String, ClientError> {
            unimplemented!()
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
            let call = self.status_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(ProvisionerStatus::InProgress)
            } else {
                Ok(ProvisionerStatus::Succeeded)
            }
        }
    }

    #[tokio::test]
    async fn test_create_runtime_requests_then_polls() {
        let provisioner = Arc::new(TwoPhaseProvisioner {
            provision_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        });
        let step = CreateRuntimeStep::new(provisioner.clone())
            .with_check_interval(Duration::from_millis(10));

        // First invocation issues the request and parks the operation.
        let StepResult::Retry { operation, .. } = step.run(provision_operation()).await else {
            panic!("expected retry after issuing the request");
        };
        // Second invocation sees the stored correlation id and polls.
        let StepResult::Retry { operation, .. } = step.run(operation).await else {
            panic!("expected retry while provisioner is working");
        };
        let StepResult::Completed(operation) = step.run(operation).await else {
            panic!("expected completion once provisioner succeeded");
        };

        let OperationPayload::Provision(payload) = &operation.payload else {
            unreachable!()
        };
        assert_eq!(payload.runtime_id.as_deref(), Some("runtime-1"));
        assert_eq!(provisioner.provision_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provisioner.status_calls.load(Ordering::SeqCst), 2);
    }
}
