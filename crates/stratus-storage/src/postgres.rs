//! PostgreSQL implementation of the stores.
//!
//! Records are stored with their kind-specific payloads as JSONB; the
//! optimistic-concurrency contract is enforced with
//! `WHERE version = $expected ... version = version + 1` updates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use stratus_core::filter::paginate;
use stratus_core::operation::OperationPayload;
use stratus_core::orchestration::OrchestrationParameters;
use stratus_core::{
    ChildCounters, Operation, OperationFilter, OperationKind, OperationState, Orchestration,
    OrchestrationFilter,
};

use crate::store::{ChildPage, OperationStore, OrchestrationStore, StoreError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL store backing both traits.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database and apply pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        MIGRATOR.run(&pool).await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn row_to_operation(row: &PgRow) -> Result<Operation, StoreError> {
    let payload: serde_json::Value = row.try_get("payload").map_err(db_err)?;
    let payload: OperationPayload = serde_json::from_value(payload).map_err(ser_err)?;
    let progress: serde_json::Value = row.try_get("progress").map_err(db_err)?;
    let progress: BTreeMap<String, DateTime<Utc>> =
        serde_json::from_value(progress).map_err(ser_err)?;
    let state: String = row.try_get("state").map_err(db_err)?;

    Ok(Operation {
        id: row.try_get("id").map_err(db_err)?,
        instance_id: row.try_get("instance_id").map_err(db_err)?,
        orchestration_id: row.try_get("orchestration_id").map_err(db_err)?,
        state: state.parse().map_err(ser_err)?,
        description: row.try_get("description").map_err(db_err)?,
        progress,
        payload,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
    })
}

fn row_to_orchestration(row: &PgRow) -> Result<Orchestration, StoreError> {
    let parameters: serde_json::Value = row.try_get("parameters").map_err(db_err)?;
    let parameters: OrchestrationParameters =
        serde_json::from_value(parameters).map_err(ser_err)?;
    let counters: serde_json::Value = row.try_get("counters").map_err(db_err)?;
    let counters: ChildCounters = serde_json::from_value(counters).map_err(ser_err)?;
    let state: String = row.try_get("state").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;

    Ok(Orchestration {
        id: row.try_get("id").map_err(db_err)?,
        kind: kind.parse().map_err(ser_err)?,
        state: state.parse().map_err(ser_err)?,
        description: row.try_get("description").map_err(db_err)?,
        parameters,
        counters,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
    })
}

#[async_trait]
impl OperationStore for PostgresStore {
    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    async fn insert(&self, operation: Operation) -> Result<(), StoreError> {
        let payload = serde_json::to_value(&operation.payload).map_err(ser_err)?;
        let progress = serde_json::to_value(&operation.progress).map_err(ser_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO operations
                (id, instance_id, orchestration_id, kind, state, description,
                 progress, payload, created_at, updated_at, finished_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(operation.id)
        .bind(&operation.instance_id)
        .bind(operation.orchestration_id)
        .bind(operation.kind().as_str())
        .bind(operation.state.to_string())
        .bind(&operation.description)
        .bind(&progress)
        .bind(&payload)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .bind(operation.finished_at)
        .bind(operation.version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(operation.id));
        }
        debug!("inserted operation");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Operation, StoreError> {
        let row = sqlx::query("SELECT * FROM operations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::OperationNotFound(id))?;

        row_to_operation(&row)
    }

    async fn get_last_by_instance(&self, instance_id: &str) -> Result<Operation, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM operations WHERE instance_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        row_to_operation(&row)
    }

    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    async fn update(&self, mut operation: Operation) -> Result<Operation, StoreError> {
        let payload = serde_json::to_value(&operation.payload).map_err(ser_err)?;
        let progress = serde_json::to_value(&operation.progress).map_err(ser_err)?;

        let row = sqlx::query(
            r#"
            UPDATE operations
            SET state = $2, description = $3, progress = $4, payload = $5,
                updated_at = $6, finished_at = $7, version = version + 1
            WHERE id = $1 AND version = $8
            RETURNING version
            "#,
        )
        .bind(operation.id)
        .bind(operation.state.to_string())
        .bind(&operation.description)
        .bind(&progress)
        .bind(&payload)
        .bind(operation.updated_at)
        .bind(operation.finished_at)
        .bind(operation.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                operation.version = row.try_get("version").map_err(db_err)?;
                Ok(operation)
            }
            None => {
                let stored = sqlx::query("SELECT version FROM operations WHERE id = $1")
                    .bind(operation.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?
                    .ok_or(StoreError::OperationNotFound(operation.id))?;
                Err(StoreError::Conflict {
                    expected: operation.version,
                    stored: stored.try_get("version").map_err(db_err)?,
                })
            }
        }
    }

    async fn list_not_finished_by_kind(
        &self,
        kind: OperationKind,
    ) -> Result<Vec<Operation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM operations
            WHERE kind = $1 AND state NOT IN ('succeeded', 'failed', 'canceled')
            ORDER BY created_at ASC
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_operation).collect()
    }

    async fn list_by_orchestration(
        &self,
        orchestration_id: Uuid,
        filter: OperationFilter,
    ) -> Result<ChildPage, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM operations WHERE orchestration_id = $1 ORDER BY created_at ASC",
        )
        .bind(orchestration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let children: Vec<Operation> = rows
            .iter()
            .map(row_to_operation)
            .collect::<Result<_, _>>()?;

        let in_progress_count = children
            .iter()
            .filter(|op| op.state == OperationState::InProgress)
            .count();

        let matching: Vec<Operation> = children
            .into_iter()
            .filter(|op| filter.matches(op))
            .collect();
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
impl OrchestrationStore for PostgresStore {
    #[instrument(skip(self, orchestration), fields(orchestration_id = %orchestration.id))]
    async fn insert(&self, orchestration: Orchestration) -> Result<(), StoreError> {
        let parameters = serde_json::to_value(&orchestration.parameters).map_err(ser_err)?;
        let counters = serde_json::to_value(orchestration.counters).map_err(ser_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO orchestrations
                (id, kind, state, description, parameters, counters,
                 created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(orchestration.id)
        .bind(orchestration.kind.as_str())
        .bind(orchestration.state.to_string())
        .bind(&orchestration.description)
        .bind(&parameters)
        .bind(&counters)
        .bind(orchestration.created_at)
        .bind(orchestration.updated_at)
        .bind(orchestration.version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(orchestration.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Orchestration, StoreError> {
        let row = sqlx::query("SELECT * FROM orchestrations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::OrchestrationNotFound(id))?;

        row_to_orchestration(&row)
    }

    #[instrument(skip(self, orchestration), fields(orchestration_id = %orchestration.id))]
    async fn update(&self, mut orchestration: Orchestration) -> Result<Orchestration, StoreError> {
        let parameters = serde_json::to_value(&orchestration.parameters).map_err(ser_err)?;
        let counters = serde_json::to_value(orchestration.counters).map_err(ser_err)?;

        let row = sqlx::query(
            r#"
            UPDATE orchestrations
            SET state = $2, description = $3, parameters = $4, counters = $5,
                updated_at = $6, version = version + 1
            WHERE id = $1 AND version = $7
            RETURNING version
            "#,
        )
        .bind(orchestration.id)
        .bind(orchestration.state.to_string())
        .bind(&orchestration.description)
        .bind(&parameters)
        .bind(&counters)
        .bind(orchestration.updated_at)
        .bind(orchestration.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                orchestration.version = row.try_get("version").map_err(db_err)?;
                Ok(orchestration)
            }
            None => {
                let stored = sqlx::query("SELECT version FROM orchestrations WHERE id = $1")
                    .bind(orchestration.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?
                    .ok_or(StoreError::OrchestrationNotFound(orchestration.id))?;
                Err(StoreError::Conflict {
                    expected: orchestration.version,
                    stored: stored.try_get("version").map_err(db_err)?,
                })
            }
        }
    }

    async fn list(&self, filter: OrchestrationFilter) -> Result<Vec<Orchestration>, StoreError> {
        let rows = sqlx::query("SELECT * FROM orchestrations ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let all: Vec<Orchestration> = rows
            .iter()
            .map(row_to_orchestration)
            .collect::<Result<_, _>>()?;

        let matching: Vec<Orchestration> = all.into_iter().filter(|o| filter.matches(o)).collect();
        Ok(paginate(matching, filter.page, filter.page_size))
    }
}
