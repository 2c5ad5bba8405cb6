//! PostgreSQL adapter for the idempotency store.
//!
//! Key uniqueness is enforced by the primary key. `insert_pending` uses
//! `ON CONFLICT DO NOTHING RETURNING` so a collision is reported as data
//! rather than as a constraint error, then reads the winning row.

use crate::idempotency::{
    IdempotencyRecord, IdempotencyState, IdempotencyStore, InsertOutcome, RequestFingerprint,
    StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS idempotency_keys (
        key          TEXT PRIMARY KEY,
        method       TEXT NOT NULL,
        route        TEXT NOT NULL,
        request_hash TEXT NOT NULL,
        state        TEXT NOT NULL,
        status_code  INTEGER,
        response     JSONB,
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idempotency_keys_state_created
        ON idempotency_keys (state, created_at)",
    "CREATE INDEX IF NOT EXISTS idempotency_keys_state_updated
        ON idempotency_keys (state, updated_at)",
];

const SELECT_COLUMNS: &str = "key, method, route, request_hash, state, status_code, response, \
     created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the table and indexes when they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let key: String = row.try_get("key")?;
    let raw_state: String = row.try_get("state")?;
    let state = IdempotencyState::parse(&raw_state).ok_or_else(|| StoreError::Corrupt {
        key: key.clone(),
        reason: format!("unknown state {raw_state}"),
    })?;
    let status_code = row
        .try_get::<Option<i32>, _>("status_code")?
        .map(|code| {
            u16::try_from(code).map_err(|_| StoreError::Corrupt {
                key: key.clone(),
                reason: format!("status code {code} out of range"),
            })
        })
        .transpose()?;
    Ok(IdempotencyRecord {
        method: row.try_get("method")?,
        route: row.try_get("route")?,
        request_hash: row.try_get("request_hash")?,
        state,
        status_code,
        response: row.try_get::<Option<Value>, _>("response")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        key,
    })
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn insert_pending(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO idempotency_keys
                (key, method, route, request_hash, state, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             ON CONFLICT (key) DO NOTHING
             RETURNING key",
        )
        .bind(key)
        .bind(&fingerprint.method)
        .bind(&fingerprint.route)
        .bind(&fingerprint.request_hash)
        .bind(IdempotencyState::Pending.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(InsertOutcome::Created);
        }

        match self.get_by_key(key).await? {
            Some(existing) => Ok(InsertOutcome::AlreadyExists(existing)),
            None => Err(StoreError::Vanished {
                key: key.to_string(),
            }),
        }
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM idempotency_keys WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn mark_completed(
        &self,
        key: &str,
        status_code: u16,
        response: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE idempotency_keys
             SET state = $2, status_code = $3, response = $4, updated_at = $5
             WHERE key = $1 AND state = $6",
        )
        .bind(key)
        .bind(IdempotencyState::Completed.as_str())
        .bind(i32::from(status_code))
        .bind(response)
        .bind(now)
        .bind(IdempotencyState::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_by_key(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(
        &self,
        completed_before: DateTime<Utc>,
        pending_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_keys
             WHERE (state = $1 AND created_at < $2)
                OR (state = $3 AND updated_at < $4)",
        )
        .bind(IdempotencyState::Completed.as_str())
        .bind(completed_before)
        .bind(IdempotencyState::Pending.as_str())
        .bind(pending_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
