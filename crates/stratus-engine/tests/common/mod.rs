#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use stratus_core::{
    Operation, PlanId, ProvisioningParameters, ResolveError, RuntimeRef, RuntimeResolver,
    TargetSelector,
};
use stratus_engine::{Step, StepResult};

pub fn provisioning_parameters(plan: PlanId) -> ProvisioningParameters {
    ProvisioningParameters {
        plan,
        region: "westeurope".into(),
        platform_region: None,
        parameters: serde_json::json!({}),
    }
}

pub fn provision_operation(instance: &str) -> Operation {
    Operation::new_provision(instance, provisioning_parameters(PlanId::Standard))
}

pub fn runtime_ref(n: usize) -> RuntimeRef {
    RuntimeRef {
        runtime_id: format!("runtime-{n:02}"),
        instance_id: format!("instance-{n:02}"),
        shoot_name: format!("shoot-{n:02}"),
        region: "westeurope".into(),
        plan: PlanId::Standard,
    }
}

type Script = Box<dyn Fn(usize, Operation) -> StepResult + Send + Sync>;

/// A step whose behavior is scripted per invocation; counts its calls.
pub struct ScriptedStep {
    name: String,
    calls: Arc<AtomicUsize>,
    script: Script,
}

impl ScriptedStep {
    /// `script` receives the 1-based call number and the operation.
    pub fn new(
        name: impl Into<String>,
        script: impl Fn(usize, Operation) -> StepResult + Send + Sync + 'static,
    ) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name: name.into(),
                calls: Arc::clone(&calls),
                script: Box::new(script),
            },
            calls,
        )
    }

    pub fn succeeding(name: impl Into<String>) -> (Self, Arc<AtomicUsize>) {
        Self::new(name, |_, op| StepResult::Completed(op))
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(call, operation)
    }
}

/// A step that blocks on a semaphore permit before completing, so tests can
/// hold operations in flight.
pub struct GatedStep {
    name: String,
    pub calls: Arc<AtomicUsize>,
    pub gate: Arc<tokio::sync::Semaphore>,
}

impl GatedStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(tokio::sync::Semaphore::new(0)),
        }
    }
}

#[async_trait]
impl Step for GatedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, operation: Operation) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.gate.acquire().await {
            Ok(permit) => {
                permit.forget();
                StepResult::Completed(operation)
            }
            Err(_) => StepResult::failed(operation, "gate closed"),
        }
    }
}

/// Resolver returning a fixed runtime list.
pub struct FixedResolver {
    pub runtimes: Vec<RuntimeRef>,
}

#[async_trait]
impl RuntimeResolver for FixedResolver {
    async fn resolve(&self, _selector: &TargetSelector) -> Result<Vec<RuntimeRef>, ResolveError> {
        Ok(self.runtimes.clone())
    }
}

/// Resolver that always fails.
pub struct BrokenResolver;

#[async_trait]
impl RuntimeResolver for BrokenResolver {
    async fn resolve(&self, _selector: &TargetSelector) -> Result<Vec<RuntimeRef>, ResolveError> {
        Err(ResolveError::Unavailable("catalog is down".into()))
    }
}

/// Poll until `condition` holds, failing the test after ~5s.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Poll an async probe until it returns true, failing the test after ~5s.
pub async fn wait_until_async<F, Fut>(what: &str, probe: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
