use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use stratus_core::filter::paginate;
use stratus_core::{
    Operation, OperationFilter, OperationKind, OperationState, Orchestration, OrchestrationFilter,
};

use crate::store::{ChildPage, OperationStore, OrchestrationStore, StoreError};

/// In-memory store backing both traits.
///
/// Used in development (`DB_IN_MEMORY`) and throughout the test suites. It
/// enforces the same optimistic-concurrency contract as the PostgreSQL
/// implementation.
#[derive(Default)]
pub struct InMemoryStore {
    operations: RwLock<HashMap<Uuid, Operation>>,
    orchestrations: RwLock<HashMap<Uuid, Orchestration>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored operations, for tests.
    pub fn operation_count(&self) -> usize {
        self.operations.read().len()
    }
}

#[async_trait]
impl OperationStore for InMemoryStore {
    async fn insert(&self, operation: Operation) -> Result<(), StoreError> {
        let mut operations = self.operations.write();
        if operations.contains_key(&operation.id) {
            return Err(StoreError::AlreadyExists(operation.id));
        }
        operations.insert(operation.id, operation);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Operation, StoreError> {
        self.operations
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::OperationNotFound(id))
    }

    async fn get_last_by_instance(&self, instance_id: &str) -> Result<Operation, StoreError> {
        self.operations
            .read()
            .values()
            .filter(|op| op.instance_id == instance_id)
            .max_by_key(|op| op.created_at)
            .cloned()
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))
    }

    async fn update(&self, mut operation: Operation) -> Result<Operation, StoreError> {
        let mut operations = self.operations.write();
        let stored = operations
            .get(&operation.id)
            .ok_or(StoreError::OperationNotFound(operation.id))?;

        if stored.version != operation.version {
            return Err(StoreError::Conflict {
                expected: operation.version,
                stored: stored.version,
            });
        }

        operation.version += 1;
        operations.insert(operation.id, operation.clone());
        Ok(operation)
    }

    async fn list_not_finished_by_kind(
        &self,
        kind: OperationKind,
    ) -> Result<Vec<Operation>, StoreError> {
        let mut result: Vec<Operation> = self
            .operations
            .read()
            .values()
            .filter(|op| op.kind() == kind && !op.is_finished())
            .cloned()
            .collect();
        result.sort_by_key(|op| op.created_at);
        Ok(result)
    }

    async fn list_by_orchestration(
        &self,
        orchestration_id: Uuid,
        filter: OperationFilter,
    ) -> Result<ChildPage, StoreError> {
        let operations = self.operations.read();
        let children: Vec<&Operation> = operations
            .values()
            .filter(|op| op.orchestration_id == Some(orchestration_id))
            .collect();

        let in_progress_count = children
            .iter()
            .filter(|op| op.state == OperationState::InProgress)
            .count();

        let mut matching: Vec<Operation> = children
            .into_iter()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect();
        matching.sort_by_key(|op| op.created_at);

        let total = matching.len();
        let operations = paginate(matching, filter.page, filter.page_size);

        Ok(ChildPage {
            operations,
            in_progress_count,
            total,
        })
    }
}

#[async_trait]
impl OrchestrationStore for InMemoryStore {
    async fn insert(&self, orchestration: Orchestration) -> Result<(), StoreError> {
        let mut orchestrations = self.orchestrations.write();
        if orchestrations.contains_key(&orchestration.id) {
            return Err(StoreError::AlreadyExists(orchestration.id));
        }
        orchestrations.insert(orchestration.id, orchestration);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Orchestration, StoreError> {
        self.orchestrations
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::OrchestrationNotFound(id))
    }

    async fn update(&self, mut orchestration: Orchestration) -> Result<Orchestration, StoreError> {
        let mut orchestrations = self.orchestrations.write();
        let stored = orchestrations
            .get(&orchestration.id)
            .ok_or(StoreError::OrchestrationNotFound(orchestration.id))?;

        if stored.version != orchestration.version {
            return Err(StoreError::Conflict {
                expected: orchestration.version,
                stored: stored.version,
            });
        }

        orchestration.version += 1;
        orchestrations.insert(orchestration.id, orchestration.clone());
        Ok(orchestration)
    }

    async fn list(&self, filter: OrchestrationFilter) -> Result<Vec<Orchestration>, StoreError> {
        let mut result: Vec<Orchestration> = self
            .orchestrations
            .read()
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        result.sort_by_key(|o| o.created_at);
        Ok(paginate(result, filter.page, filter.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::{
        OrchestrationKind, OrchestrationParameters, PlanId, ProvisioningParameters,
    };

    fn provision_op(instance: &str) -> Operation {
        Operation::new_provision(
            instance,
            ProvisioningParameters {
                plan: PlanId::Standard,
                region: "westeurope".into(),
                platform_region: None,
                parameters: serde_json::json!({}),
            },
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_operation() {
        let store = InMemoryStore::new();
        let op = provision_op("inst-1");
        let id = op.id;

        OperationStore::insert(&store, op).await.unwrap();
        let loaded = OperationStore::get(&store, id).await.unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.state, OperationState::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let store = InMemoryStore::new();
        let op = provision_op("inst-1");

        OperationStore::insert(&store, op.clone()).await.unwrap();
        let result = OperationStore::insert(&store, op).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_detects_conflicts() {
        let store = InMemoryStore::new();
        let op = provision_op("inst-1");
        let id = op.id;
        OperationStore::insert(&store, op).await.unwrap();

        let mut first = OperationStore::get(&store, id).await.unwrap();
        let stale = first.clone();

        first.description = "step one".into();
        let updated = OperationStore::update(&store, first).await.unwrap();
        assert_eq!(updated.version, 1);

        // The second writer read version 0 and must lose.
        let result = OperationStore::update(&store, stale).await;
        assert!(matches!(
            result,
            Err(StoreError::Conflict {
                expected: 0,
                stored: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_last_by_instance_picks_newest() {
        let store = InMemoryStore::new();
        let older = provision_op("inst-1");
        let mut newer = Operation::new_deprovision("inst-1", PlanId::Standard, None);
        newer.created_at = older.created_at + chrono::Duration::seconds(1);

        OperationStore::insert(&store, older).await.unwrap();
        OperationStore::insert(&store, newer.clone()).await.unwrap();

        let last = store.get_last_by_instance("inst-1").await.unwrap();
        assert_eq!(last.id, newer.id);

        let missing = store.get_last_by_instance("inst-2").await;
        assert!(matches!(missing, Err(StoreError::InstanceNotFound(_))));
    }

    #[tokio::test]
    async fn test_not_finished_listing_sorts_by_creation() {
        let store = InMemoryStore::new();
        let mut first = provision_op("inst-1");
        let mut second = provision_op("inst-2");
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        let mut finished = provision_op("inst-3");
        finished.state = OperationState::Succeeded;
        first.created_at -= chrono::Duration::seconds(5);

        OperationStore::insert(&store, second.clone()).await.unwrap();
        OperationStore::insert(&store, first.clone()).await.unwrap();
        OperationStore::insert(&store, finished).await.unwrap();

        let listed = store
            .list_not_finished_by_kind(OperationKind::Provision)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn test_children_listing_counts_in_progress_regardless_of_filter() {
        let store = InMemoryStore::new();
        let orchestration = Orchestration::new(
            OrchestrationKind::UpgradeRuntime,
            OrchestrationParameters::default(),
        );

        for i in 0..3 {
            let mut child = provision_op(&format!("inst-{i}"));
            child.orchestration_id = Some(orchestration.id);
            if i == 0 {
                child.state = OperationState::InProgress;
            }
            OperationStore::insert(&store, child).await.unwrap();
        }

        let page = store
            .list_by_orchestration(
                orchestration.id,
                OperationFilter::with_states([OperationState::Pending]),
            )
            .await
            .unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(page.operations.len(), 2);
        assert_eq!(page.in_progress_count, 1);
    }

    #[tokio::test]
    async fn test_orchestration_filter_by_state() {
        let store = InMemoryStore::new();
        let pending = Orchestration::new(
            OrchestrationKind::UpgradeRuntime,
            OrchestrationParameters::default(),
        );
        let mut canceling = Orchestration::new(
            OrchestrationKind::UpgradeRuntime,
            OrchestrationParameters::default(),
        );
        canceling.state = stratus_core::OrchestrationState::Canceling;

        OrchestrationStore::insert(&store, pending).await.unwrap();
        OrchestrationStore::insert(&store, canceling.clone())
            .await
            .unwrap();

        let listed = store
            .list(OrchestrationFilter::with_kind_and_states(
                OrchestrationKind::UpgradeRuntime,
                [stratus_core::OrchestrationState::Canceling],
            ))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, canceling.id);
    }
}
