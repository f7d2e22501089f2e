use std::sync::Arc;

use stratus_engine::{SkipForPlan, StepRegistry};

use crate::clients::{AccountProvider, EvaluationClient, ProvisionerClient};
use crate::config::Config;
use crate::steps::deprovisioning::{
    ReleaseCredentialsStep, RemoveEvaluationsStep, RemoveRuntimeStep,
};
use crate::steps::init::InitializeStep;
use crate::steps::provisioning::{
    AuditLogStep, CreateRuntimeStep, ExternalEvaluationStep, ResolveCredentialsStep,
};
use crate::steps::update::ApplyParametersStep;
use crate::steps::upgrade::{UpgradeClusterStep, UpgradeRuntimeStep};

/// Clients shared by the step pipelines.
pub struct PipelineDeps {
    pub provisioner: Arc<dyn ProvisionerClient>,
    pub evaluations: Arc<dyn EvaluationClient>,
    pub accounts: Arc<dyn AccountProvider>,
}

/// The weights mirror the dependency order of the external systems:
/// credentials and evaluations before overrides, the provisioner call last.
pub fn provisioning_registry(config: &Config, deps: &PipelineDeps) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.set_init(InitializeStep::new(&config.runtime_version));
    registry.add_step(2, ResolveCredentialsStep::new(deps.accounts.clone()));
    // Trial instances get no paid evaluation.
    registry.add_step_when(
        2,
        ExternalEvaluationStep::new(deps.evaluations.clone()),
        |operation| operation.plan().is_trial(),
    );
    registry.add_step(
        3,
        SkipForPlan::trial(AuditLogStep::new(&config.audit_log_tenant)),
    );
    registry.add_step(10, CreateRuntimeStep::new(deps.provisioner.clone()));
    registry
}

pub fn deprovisioning_registry(deps: &PipelineDeps) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.add_step(1, RemoveEvaluationsStep::new(deps.evaluations.clone()));
    registry.add_step(2, ReleaseCredentialsStep::new(deps.accounts.clone()));
    registry.add_step(10, RemoveRuntimeStep::new(deps.provisioner.clone()));
    registry
}

pub fn upgrade_runtime_registry(deps: &PipelineDeps) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.add_step(10, UpgradeRuntimeStep::new(deps.provisioner.clone()));
    registry
}

pub fn upgrade_cluster_registry(deps: &PipelineDeps) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.add_step(10, UpgradeClusterStep::new(deps.provisioner.clone()));
    registry
}

pub fn update_registry(deps: &PipelineDeps) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.add_step(10, ApplyParametersStep::new(deps.provisioner.clone()));
    registry
}
