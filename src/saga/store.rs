//! # Saga Persistence
//!
//! Sagas live in a single `sagas` table with the step list and metadata
//! serialized into a JSONB payload column. Scalar columns (state, cursor,
//! correlation id) are kept alongside so operator queries and the crash
//! recovery scan never have to unpack the payload.

use crate::messaging::{MessagingError, MessagingResult};
use crate::saga::definition::{SagaDefinition, SagaStep};
use crate::saga::states::SagaState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

/// Durable store for saga definitions.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn insert(&self, saga: &SagaDefinition) -> MessagingResult<()>;

    /// Persist the current cursor, state, and step list. Called after every
    /// step transition.
    async fn update(&self, saga: &SagaDefinition) -> MessagingResult<()>;

    async fn load(&self, saga_id: Uuid) -> MessagingResult<Option<SagaDefinition>>;

    /// Every saga not yet in a terminal state; the crash recovery scan.
    async fn load_active(&self) -> MessagingResult<Vec<SagaDefinition>>;
}

/// PostgreSQL-backed [`SagaStore`].
///
/// Schema:
/// ```sql
/// CREATE TABLE sagas (
///   saga_id UUID PRIMARY KEY,
///   saga_type VARCHAR NOT NULL,
///   tenant_id VARCHAR NOT NULL,
///   correlation_id UUID NOT NULL,
///   current_step INTEGER NOT NULL,
///   state VARCHAR NOT NULL,
///   payload JSONB NOT NULL,
///   created_at TIMESTAMPTZ NOT NULL,
///   updated_at TIMESTAMPTZ NOT NULL
/// );
/// ```
pub struct PgSagaStore {
    pool: PgPool,
}

impl PgSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SagaRow {
    saga_id: Uuid,
    saga_type: String,
    tenant_id: String,
    correlation_id: Uuid,
    current_step: i32,
    state: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SagaRow {
    fn into_definition(self) -> MessagingResult<SagaDefinition> {
        let state = self
            .state
            .parse::<SagaState>()
            .map_err(MessagingError::internal)?;
        let steps: Vec<SagaStep> = serde_json::from_value(
            self.payload
                .get("steps")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )?;
        let metadata: HashMap<String, serde_json::Value> = self
            .payload
            .get("metadata")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        Ok(SagaDefinition {
            saga_id: self.saga_id,
            saga_type: self.saga_type,
            tenant_id: self.tenant_id,
            correlation_id: self.correlation_id,
            steps,
            current_step_index: self.current_step as usize,
            state,
            created_at: self.created_at,
            updated_at: self.updated_at,
            metadata,
        })
    }
}

fn payload_value(saga: &SagaDefinition) -> MessagingResult<serde_json::Value> {
    Ok(json!({
        "steps": serde_json::to_value(&saga.steps)?,
        "metadata": serde_json::to_value(&saga.metadata)?,
    }))
}

#[async_trait]
impl SagaStore for PgSagaStore {
    async fn insert(&self, saga: &SagaDefinition) -> MessagingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sagas
                (saga_id, saga_type, tenant_id, correlation_id, current_step,
                 state, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(saga.saga_id)
        .bind(&saga.saga_type)
        .bind(&saga.tenant_id)
        .bind(saga.correlation_id)
        .bind(saga.current_step_index as i32)
        .bind(saga.state.to_string())
        .bind(payload_value(saga)?)
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, saga: &SagaDefinition) -> MessagingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET current_step = $2, state = $3, payload = $4, updated_at = $5
            WHERE saga_id = $1
            "#,
        )
        .bind(saga.saga_id)
        .bind(saga.current_step_index as i32)
        .bind(saga.state.to_string())
        .bind(payload_value(saga)?)
        .bind(saga.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MessagingError::saga(
                saga.saga_id.to_string(),
                "saga row missing on update",
            ));
        }
        Ok(())
    }

    async fn load(&self, saga_id: Uuid) -> MessagingResult<Option<SagaDefinition>> {
        let row = sqlx::query_as::<_, SagaRow>(
            r#"
            SELECT saga_id, saga_type, tenant_id, correlation_id, current_step,
                   state, payload, created_at, updated_at
            FROM sagas
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SagaRow::into_definition).transpose()
    }

    async fn load_active(&self) -> MessagingResult<Vec<SagaDefinition>> {
        let rows = sqlx::query_as::<_, SagaRow>(
            r#"
            SELECT saga_id, saga_type, tenant_id, correlation_id, current_step,
                   state, payload, created_at, updated_at
            FROM sagas
            WHERE state NOT IN ('completed', 'compensated')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SagaRow::into_definition).collect()
    }
}
