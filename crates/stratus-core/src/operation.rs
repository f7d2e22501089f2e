//! Durable operation records.
//!
//! An operation is a single lifecycle action on one instance. The engine
//! drives it through a pipeline of steps; every persisted mutation bumps the
//! `version` counter so concurrent writers are detected by the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::PlanId;
use crate::runtime::RuntimeRef;

/// Lifecycle state of an operation.
///
/// Transitions follow `Pending -> InProgress -> {Succeeded|Failed|Canceled}`;
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Canceled
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for OperationState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Error returned when parsing an operation state fails.
#[derive(Debug, thiserror::Error)]
#[error("unknown operation state: {0}")]
pub struct UnknownState(pub String);

/// Kind of lifecycle action an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Provision,
    Deprovision,
    UpgradeRuntime,
    UpgradeCluster,
    Update,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::UpgradeRuntime => "upgrade_runtime",
            Self::UpgradeCluster => "upgrade_cluster",
            Self::Update => "update",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(Self::Provision),
            "deprovision" => Ok(Self::Deprovision),
            "upgrade_runtime" => Ok(Self::UpgradeRuntime),
            "upgrade_cluster" => Ok(Self::UpgradeCluster),
            "update" => Ok(Self::Update),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Error returned when parsing an operation kind fails.
#[derive(Debug, thiserror::Error)]
#[error("unknown operation kind: {0}")]
pub struct UnknownKind(pub String);

/// Client-supplied provisioning input, kept verbatim in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningParameters {
    pub plan: PlanId,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_region: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Hyperscaler credentials resolved for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsRef {
    pub provider_account_id: String,
    pub secret_name: String,
}

/// Step-owned sub-state of a provision operation.
///
/// Every field is written by exactly one step and checked by that step before
/// it repeats an external side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionPayload {
    pub parameters: ProvisioningParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

/// Step-owned sub-state of a deprovision operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprovisionPayload {
    pub plan: PlanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_operation_id: Option<String>,
    #[serde(default)]
    pub evaluation_removed: bool,
    #[serde(default)]
    pub credentials_released: bool,
}

/// Step-owned sub-state of an upgrade-runtime child operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRuntimePayload {
    pub runtime: RuntimeRef,
    pub target_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_operation_id: Option<String>,
}

/// Step-owned sub-state of an upgrade-cluster child operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeClusterPayload {
    pub runtime: RuntimeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_operation_id: Option<String>,
}

/// Step-owned sub-state of an update operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub plan: PlanId,
    #[serde(default)]
    pub new_parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_operation_id: Option<String>,
}

/// Kind-specific payload of an operation.
///
/// The engine is generic over the common envelope; only the steps look inside
/// their own variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    Provision(ProvisionPayload),
    Deprovision(DeprovisionPayload),
    UpgradeRuntime(UpgradeRuntimePayload),
    UpgradeCluster(UpgradeClusterPayload),
    Update(UpdatePayload),
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Provision(_) => OperationKind::Provision,
            Self::Deprovision(_) => OperationKind::Deprovision,
            Self::UpgradeRuntime(_) => OperationKind::UpgradeRuntime,
            Self::UpgradeCluster(_) => OperationKind::UpgradeCluster,
            Self::Update(_) => OperationKind::Update,
        }
    }
}

/// A single durable lifecycle action on one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestration_id: Option<Uuid>,
    pub state: OperationState,
    pub description: String,
    /// Step name -> completion time. Once recorded, never cleared.
    #[serde(default)]
    pub progress: BTreeMap<String, DateTime<Utc>>,
    pub payload: OperationPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter, bumped by the store on every update.
    pub version: i64,
}

impl Operation {
    fn new(instance_id: impl Into<String>, payload: OperationPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.into(),
            orchestration_id: None,
            state: OperationState::Pending,
            description: "operation created".to_string(),
            progress: BTreeMap::new(),
            payload,
            created_at: now,
            updated_at: now,
            finished_at: None,
            version: 0,
        }
    }

    pub fn new_provision(instance_id: impl Into<String>, parameters: ProvisioningParameters) -> Self {
        Self::new(
            instance_id,
            OperationPayload::Provision(ProvisionPayload {
                parameters,
                runtime_version: None,
                credentials: None,
                evaluation_id: None,
                audit_log_tenant: None,
                provisioner_operation_id: None,
                runtime_id: None,
                dashboard_url: None,
            }),
        )
    }

    pub fn new_deprovision(
        instance_id: impl Into<String>,
        plan: PlanId,
        runtime_id: Option<String>,
    ) -> Self {
        Self::new(
            instance_id,
            OperationPayload::Deprovision(DeprovisionPayload {
                plan,
                runtime_id,
                provisioner_operation_id: None,
                evaluation_removed: false,
                credentials_released: false,
            }),
        )
    }

    pub fn new_upgrade_runtime(
        orchestration_id: Uuid,
        runtime: RuntimeRef,
        target_version: impl Into<String>,
    ) -> Self {
        let mut op = Self::new(
            runtime.instance_id.clone(),
            OperationPayload::UpgradeRuntime(UpgradeRuntimePayload {
                runtime,
                target_version: target_version.into(),
                provisioner_operation_id: None,
            }),
        );
        op.orchestration_id = Some(orchestration_id);
        op
    }

    pub fn new_upgrade_cluster(orchestration_id: Uuid, runtime: RuntimeRef) -> Self {
        let mut op = Self::new(
            runtime.instance_id.clone(),
            OperationPayload::UpgradeCluster(UpgradeClusterPayload {
                runtime,
                provisioner_operation_id: None,
            }),
        );
        op.orchestration_id = Some(orchestration_id);
        op
    }

    pub fn new_update(
        instance_id: impl Into<String>,
        plan: PlanId,
        new_parameters: serde_json::Value,
    ) -> Self {
        Self::new(
            instance_id,
            OperationPayload::Update(UpdatePayload {
                plan,
                new_parameters,
                provisioner_operation_id: None,
            }),
        )
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// Plan of the instance the operation targets; drives plan-gated steps.
    pub fn plan(&self) -> PlanId {
        match &self.payload {
            OperationPayload::Provision(p) => p.parameters.plan,
            OperationPayload::Deprovision(p) => p.plan,
            OperationPayload::UpgradeRuntime(p) => p.runtime.plan,
            OperationPayload::UpgradeCluster(p) => p.runtime.plan,
            OperationPayload::Update(p) => p.plan,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the named step already completed for this operation.
    pub fn step_completed(&self, name: &str) -> bool {
        self.progress.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioning_parameters() -> ProvisioningParameters {
        ProvisioningParameters {
            plan: PlanId::Standard,
            region: "westeurope".to_string(),
            platform_region: None,
            parameters: serde_json::json!({}),
        }
    }

    #[test]
    fn test_new_operation_starts_pending() {
        let op = Operation::new_provision("inst-1", provisioning_parameters());
        assert_eq!(op.state, OperationState::Pending);
        assert_eq!(op.kind(), OperationKind::Provision);
        assert!(op.finished_at.is_none());
        assert_eq!(op.version, 0);
        assert!(op.progress.is_empty());
    }

    #[test]
    fn test_plan_is_derived_from_payload() {
        let op = Operation::new_deprovision("inst-1", PlanId::Trial, None);
        assert_eq!(op.plan(), PlanId::Trial);
        assert_eq!(op.kind(), OperationKind::Deprovision);
    }

    #[test]
    fn test_terminal_states() {
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(OperationState::Canceled.is_terminal());
        assert!(!OperationState::Pending.is_terminal());
        assert!(!OperationState::InProgress.is_terminal());
    }

    #[test]
    fn test_payload_round_trips_with_kind_tag() {
        let op = Operation::new_provision("inst-1", provisioning_parameters());
        let json = serde_json::to_value(&op.payload).unwrap();
        assert_eq!(json["kind"], "provision");
        let back: OperationPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), OperationKind::Provision);
    }
}
