use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratus_core::{
    CredentialsRef, PlanId, ProvisioningParameters, ResolveError, RuntimeRef, RuntimeResolver,
    TargetSelector,
};

/// Error from an external service call.
///
/// Transient errors become step retries; permanent ones fail the operation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{service} unavailable: {reason}")]
    Transient { service: &'static str, reason: String },

    #[error("{service} rejected the request: {reason}")]
    Permanent { service: &'static str, reason: String },
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient { .. })
    }

    fn from_response(service: &'static str, status: reqwest::StatusCode, body: String) -> Self {
        let reason = format!("{status}: {body}");
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ClientError::Transient { service, reason }
        } else {
            ClientError::Permanent { service, reason }
        }
    }

    fn from_transport(service: &'static str, error: reqwest::Error) -> Self {
        ClientError::Transient {
            service,
            reason: error.to_string(),
        }
    }
}

/// Correlation ids returned when the provisioner accepts a request.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerResponse {
    pub operation_id: String,
    pub runtime_id: String,
}

/// Status of a provisioner-side operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProvisionerStatus {
    InProgress,
    Succeeded,
    Failed { message: String },
}

/// Drives cluster lifecycle on the hyperscaler side.
#[async_trait]
pub trait ProvisionerClient: Send + Sync + 'static {
    async fn provision_runtime(
        &self,
        instance_id: &str,
        parameters: &ProvisioningParameters,
        runtime_version: &str,
    ) -> Result<ProvisionerResponse, ClientError>;

    async fn deprovision_runtime(&self, runtime_id: &str) -> Result<String, ClientError>;

    async fn upgrade_runtime(
        &self,
        runtime_id: &str,
        target_version: &str,
    ) -> Result<String, ClientError>;

    async fn upgrade_cluster(&self, runtime_id: &str) -> Result<String, ClientError>;

    async fn update_runtime(
        &self,
        runtime_id: &str,
        parameters: &serde_json::Value,
    ) -> Result<String, ClientError>;

    async fn operation_status(
        &self,
        provisioner_operation_id: &str,
    ) -> Result<ProvisionerStatus, ClientError>;
}

/// Manages external availability evaluations per instance.
#[async_trait]
pub trait EvaluationClient: Send + Sync + 'static {
    async fn create_evaluation(&self, instance_id: &str) -> Result<i64, ClientError>;

    /// Idempotent: removing evaluations for an instance without any is fine.
    async fn remove_evaluations(&self, instance_id: &str) -> Result<(), ClientError>;
}

/// Resolves hyperscaler credentials from the shared account pool.
#[async_trait]
pub trait AccountProvider: Send + Sync + 'static {
    async fn credentials_for(
        &self,
        plan: PlanId,
        region: &str,
    ) -> Result<CredentialsRef, ClientError>;

    async fn release_credentials(&self, instance_id: &str) -> Result<(), ClientError>;
}

async fn check<T: serde::de::DeserializeOwned>(
    service: &'static str,
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, ClientError> {
    let response = response.map_err(|e| ClientError::from_transport(service, e))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::from_response(service, status, body));
    }
    response
        .json()
        .await
        .map_err(|e| ClientError::Permanent {
            service,
            reason: format!("invalid response body: {e}"),
        })
}

async fn check_empty(
    service: &'static str,
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<(), ClientError> {
    let response = response.map_err(|e| ClientError::from_transport(service, e))?;
    let status = response.status();
    if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::from_response(service, status, body));
    }
    Ok(())
}

/// HTTP implementation of [`ProvisionerClient`].
pub struct HttpProvisionerClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpProvisionerClient {
    pub fn new(base_url: String, http: reqwest::Client) -> Self {
        Self { base_url, http }
    }
}

#[derive(Serialize)]
struct ProvisionRequestBody<'a> {
    instance_id: &'a str,
    plan: PlanId,
    region: &'a str,
    runtime_version: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct OperationIdBody {
    operation_id: String,
}

#[async_trait]
impl ProvisionerClient for HttpProvisionerClient {
    async fn provision_runtime(
        &self,
        instance_id: &str,
        parameters: &ProvisioningParameters,
        runtime_version: &str,
    ) -> Result<ProvisionerResponse, ClientError> {
        debug!(instance_id, "requesting runtime provisioning");
        let body = ProvisionRequestBody {
            instance_id,
            plan: parameters.plan,
            region: &parameters.region,
            runtime_version,
            parameters: &parameters.parameters,
        };
        check(
            "provisioner",
            self.http
                .post(format!("{}/runtimes", self.base_url))
                .json(&body)
                .send()
                .await,
        )
        .await
    }

    async fn deprovision_runtime(&self, runtime_id: &str) -> Result<String, ClientError> {
        let body: OperationIdBody = check(
            "provisioner",
            self.http
                .delete(format!("{}/runtimes/{runtime_id}", self.base_url))
                .send()
                .await,
        )
        .await?;
        Ok(body.operation_id)
    }

    async fn upgrade_runtime(
        &self,
        runtime_id: &str,
        target_version: &str,
    ) -> Result<String, ClientError> {
        let body: OperationIdBody = check(
            "provisioner",
            self.http
                .post(format!("{}/runtimes/{runtime_id}/upgrade", self.base_url))
                .json(&serde_json::json!({ "target_version": target_version }))
                .send()
                .await,
        )
        .await?;
        Ok(body.operation_id)
    }

    async fn upgrade_cluster(&self, runtime_id: &str) -> Result<String, ClientError> {
        let body: OperationIdBody = check(
            "provisioner",
            self.http
                .post(format!(
                    "{}/runtimes/{runtime_id}/upgrade-cluster",
                    self.base_url
                ))
                .send()
                .await,
        )
        .await?;
        Ok(body.operation_id)
    }

    async fn update_runtime(
        &self,
        runtime_id: &str,
        parameters: &serde_json::Value,
    ) -> Result<String, ClientError> {
        let body: OperationIdBody = check(
            "provisioner",
            self.http
                .patch(format!("{}/runtimes/{runtime_id}", self.base_url))
                .json(parameters)
                .send()
                .await,
        )
        .await?;
        Ok(body.operation_id)
    }

    async fn operation_status(
        &self,
        provisioner_operation_id: &str,
    ) -> Result<ProvisionerStatus, ClientError> {
        check(
            "provisioner",
            self.http
                .get(format!(
                    "{}/operations/{provisioner_operation_id}",
                    self.base_url
                ))
                .send()
                .await,
        )
        .await
    }
}

/// HTTP implementation of [`EvaluationClient`].
pub struct HttpEvaluationClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpEvaluationClient {
    pub fn new(base_url: String, http: reqwest::Client) -> Self {
        Self { base_url, http }
    }
}

#[derive(Deserialize)]
struct EvaluationBody {
    id: i64,
}

#[async_trait]
impl EvaluationClient for HttpEvaluationClient {
    async fn create_evaluation(&self, instance_id: &str) -> Result<i64, ClientError> {
        let body: EvaluationBody = check(
            "evaluator",
            self.http
                .post(format!("{}/evaluations", self.base_url))
                .json(&serde_json::json!({ "instance_id": instance_id }))
                .send()
                .await,
        )
        .await?;
        Ok(body.id)
    }

    async fn remove_evaluations(&self, instance_id: &str) -> Result<(), ClientError> {
        check_empty(
            "evaluator",
            self.http
                .delete(format!("{}/evaluations/{instance_id}", self.base_url))
                .send()
                .await,
        )
        .await
    }
}

/// HTTP implementation of [`AccountProvider`].
pub struct HttpAccountProvider {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAccountProvider {
    pub fn new(base_url: String, http: reqwest::Client) -> Self {
        Self { base_url, http }
    }
}

#[async_trait]
impl AccountProvider for HttpAccountProvider {
    async fn credentials_for(
        &self,
        plan: PlanId,
        region: &str,
    ) -> Result<CredentialsRef, ClientError> {
        check(
            "account pool",
            self.http
                .post(format!("{}/credentials", self.base_url))
                .json(&serde_json::json!({ "plan": plan, "region": region }))
                .send()
                .await,
        )
        .await
    }

    async fn release_credentials(&self, instance_id: &str) -> Result<(), ClientError> {
        check_empty(
            "account pool",
            self.http
                .delete(format!("{}/credentials/{instance_id}", self.base_url))
                .send()
                .await,
        )
        .await
    }
}

/// Resolver backed by the external runtime catalog.
///
/// Fetches the full runtime inventory and filters it against the selector;
/// the result is sorted by runtime id so resolution is stable.
pub struct CatalogRuntimeResolver {
    base_url: String,
    http: reqwest::Client,
}

impl CatalogRuntimeResolver {
    pub fn new(base_url: String, http: reqwest::Client) -> Self {
        Self { base_url, http }
    }
}

#[async_trait]
impl RuntimeResolver for CatalogRuntimeResolver {
    async fn resolve(&self, selector: &TargetSelector) -> Result<Vec<RuntimeRef>, ResolveError> {
        let response = self
            .http
            .get(format!("{}/runtimes", self.base_url))
            .send()
            .await
            .map_err(|e| ResolveError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Unavailable(format!(
                "catalog returned {status}"
            )));
        }

        let runtimes: Vec<RuntimeRef> = response
            .json()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("invalid catalog response: {e}")))?;

        let mut matching: Vec<RuntimeRef> = runtimes
            .into_iter()
            .filter(|runtime| selector_matches(selector, runtime))
            .collect();
        matching.sort_by(|a, b| a.runtime_id.cmp(&b.runtime_id));
        matching.dedup_by(|a, b| a.runtime_id == b.runtime_id);
        Ok(matching)
    }
}

/// Whether a runtime satisfies the selector. `all` short-circuits; otherwise
/// every populated criterion may match independently (union semantics, as
/// the catalog's own target lists behave).
pub fn selector_matches(selector: &TargetSelector, runtime: &RuntimeRef) -> bool {
    if selector.all {
        return true;
    }
    if selector.runtime_ids.iter().any(|id| id == &runtime.runtime_id) {
        return true;
    }
    if selector.regions.iter().any(|region| region == &runtime.region) {
        return true;
    }
    if selector.plans.contains(&runtime.plan) {
        return true;
    }
    if selector
        .shoot_globs
        .iter()
        .any(|glob| glob_matches(glob, &runtime.shoot_name))
    {
        return true;
    }
    false
}

/// Minimal `*` wildcard matching for shoot-name globs.
fn glob_matches(pattern: &str, value: &str) -> bool {
    let mut parts = pattern.split('*').peekable();
    let mut rest = value;
    let mut first = true;

    while let Some(part) = parts.next() {
        let is_last = parts.peek().is_none();
        if first && !part.is_empty() {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if is_last {
            return part.is_empty() || rest.ends_with(part);
        } else if !part.is_empty() {
            match rest.find(part) {
                Some(index) => rest = &rest[index + part.len()..],
                None => return false,
            }
        }
        first = false;
    }
    true
}
