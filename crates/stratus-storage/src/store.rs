use async_trait::async_trait;
use uuid::Uuid;

use stratus_core::{
    Operation, OperationFilter, OperationKind, Orchestration, OrchestrationFilter,
};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Operation not found
    #[error("operation not found: {0}")]
    OperationNotFound(Uuid),

    /// No operation exists for the instance
    #[error("no operation for instance: {0}")]
    InstanceNotFound(String),

    /// Orchestration not found
    #[error("orchestration not found: {0}")]
    OrchestrationNotFound(Uuid),

    /// Optimistic locking failed: another writer got there first
    #[error("version conflict: expected {expected}, stored {stored}")]
    Conflict { expected: i64, stored: i64 },

    /// Record with the same id already exists
    #[error("record already exists: {0}")]
    AlreadyExists(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// One page of a campaign's children plus the aggregate counts the
/// supervisor and the recovery loader need.
#[derive(Debug, Clone)]
pub struct ChildPage {
    /// Children matching the filter, paged, sorted by `created_at` ascending.
    pub operations: Vec<Operation>,
    /// Children currently in progress, regardless of the filter.
    pub in_progress_count: usize,
    /// Children matching the filter, before paging.
    pub total: usize,
}

/// Durable CRUD over operation records.
///
/// Implementations must be thread-safe; `update` must reject stale versions
/// so at most one worker makes progress on an operation at a time.
#[async_trait]
pub trait OperationStore: Send + Sync + 'static {
    async fn insert(&self, operation: Operation) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Operation, StoreError>;

    /// The most recently created operation for an instance, for the
    /// last-operation endpoint.
    async fn get_last_by_instance(&self, instance_id: &str) -> Result<Operation, StoreError>;

    /// Persist a mutation. The stored version must equal
    /// `operation.version`; on success the returned record carries the
    /// bumped version.
    async fn update(&self, operation: Operation) -> Result<Operation, StoreError>;

    /// All non-terminal operations of a kind, sorted by `created_at`
    /// ascending. Used by the recovery loader.
    async fn list_not_finished_by_kind(
        &self,
        kind: OperationKind,
    ) -> Result<Vec<Operation>, StoreError>;

    /// Children of a campaign.
    async fn list_by_orchestration(
        &self,
        orchestration_id: Uuid,
        filter: OperationFilter,
    ) -> Result<ChildPage, StoreError>;
}

/// Durable CRUD over campaign records.
#[async_trait]
pub trait OrchestrationStore: Send + Sync + 'static {
    async fn insert(&self, orchestration: Orchestration) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Orchestration, StoreError>;

    /// Persist a mutation under the same optimistic contract as
    /// [`OperationStore::update`].
    async fn update(&self, orchestration: Orchestration) -> Result<Orchestration, StoreError>;

    /// Orchestrations matching the filter, sorted by `created_at` ascending.
    async fn list(&self, filter: OrchestrationFilter) -> Result<Vec<Orchestration>, StoreError>;
}
