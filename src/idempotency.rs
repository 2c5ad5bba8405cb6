use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyState {
    Pending,
    Completed,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyState::Pending => "PENDING",
            IdempotencyState::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(IdempotencyState::Pending),
            "COMPLETED" => Some(IdempotencyState::Completed),
            _ => None,
        }
    }
}

/// Identity of the request a key was first used with. Immutable per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    pub method: String,
    pub route: String,
    pub request_hash: String,
}

impl RequestFingerprint {
    pub fn new(method: &str, route: &str, request_hash: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            route: route.to_string(),
            request_hash: request_hash.to_string(),
        }
    }
}

/// A response cached under an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub method: String,
    pub route: String,
    pub request_hash: String,
    pub state: IdempotencyState,
    pub status_code: Option<u16>,
    pub response: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(key: &str, fingerprint: &RequestFingerprint, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            method: fingerprint.method.clone(),
            route: fingerprint.route.clone(),
            request_hash: fingerprint.request_hash.clone(),
            state: IdempotencyState::Pending,
            status_code: None,
            response: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn matches(&self, fingerprint: &RequestFingerprint) -> bool {
        self.method == fingerprint.method
            && self.route == fingerprint.route
            && self.request_hash == fingerprint.request_hash
    }

    /// The cached response, present only once the record completed.
    pub fn stored_response(&self) -> Option<StoredResponse> {
        if self.state != IdempotencyState::Completed {
            return None;
        }
        match (self.status_code, self.response.as_ref()) {
            (Some(status_code), Some(body)) => Some(StoredResponse {
                status_code,
                body: body.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_expired(
        &self,
        completed_before: DateTime<Utc>,
        pending_before: DateTime<Utc>,
    ) -> bool {
        match self.state {
            IdempotencyState::Completed => self.created_at < completed_before,
            IdempotencyState::Pending => self.updated_at < pending_before,
        }
    }
}

/// Result of the atomic insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created,
    AlreadyExists(IdempotencyRecord),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The insert collided with a row that was gone by the time it was read.
    #[error("idempotency record {key} vanished after a unique-key collision")]
    Vanished { key: String },

    /// Completion found the record missing or already completed.
    #[error("idempotency record {key} was not pending at finalization")]
    NotPending { key: String },

    #[error("idempotency record {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable storage for idempotency records.
///
/// Every method is a single atomic operation against the backing store.
/// Timestamps are supplied by the caller so expiry is deterministic.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn insert_pending(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError>;

    async fn get_by_key(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Flips a PENDING record to COMPLETED. Returns false when no PENDING
    /// record exists for `key`.
    async fn mark_completed(
        &self,
        key: &str,
        status_code: u16,
        response: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn delete_by_key(&self, key: &str) -> Result<bool, StoreError>;

    /// Deletes COMPLETED records created before `completed_before` and
    /// PENDING records last updated before `pending_before`.
    async fn delete_expired(
        &self,
        completed_before: DateTime<Utc>,
        pending_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Single-process store. Used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_pending(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = records.get(key) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        records.insert(
            key.to_string(),
            IdempotencyRecord::pending(key, fingerprint, now),
        );
        Ok(InsertOutcome::Created)
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn mark_completed(
        &self,
        key: &str,
        status_code: u16,
        response: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(key) {
            Some(record) if record.state == IdempotencyState::Pending => {
                record.state = IdempotencyState::Completed;
                record.status_code = Some(status_code);
                record.response = Some(response.clone());
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_key(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some())
    }

    async fn delete_expired(
        &self,
        completed_before: DateTime<Utc>,
        pending_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|_, record| !record.is_expired(completed_before, pending_before));
        Ok((before - records.len()) as u64)
    }
}
