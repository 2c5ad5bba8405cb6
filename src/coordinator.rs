//! Idempotency-key coordination.
//!
//! A request carrying a key either creates the PENDING record and runs the
//! handler, replays the cached response of a completed twin, waits briefly
//! for an in-flight twin, or is rejected because the key was used for a
//! different request. Cross-request exclusion relies only on the store.
//!
//! Handlers return a [`Prepared`] response whose business writes are held
//! back until the response is cached. If caching fails the writes are
//! discarded and the key is released, so a retry starts from a clean slate.

use crate::config::IdempotencySettings;
use crate::errors::ApiError;
use crate::idempotency::{IdempotencyStore, InsertOutcome, RequestFingerprint, StoreError, StoredResponse};
use crate::metrics::Metrics;
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// A new PENDING record was created; the caller owns the key now.
    Proceed,
    Replay(StoredResponse),
    InProgress,
    Conflict,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed(StoredResponse),
    Conflict,
    /// The owner released the key before completing.
    Released,
    TimedOut,
}

/// Side effects that become visible only when [`Prepared::commit`] runs.
pub trait DeferredWrites: Send {
    fn apply(self: Box<Self>);
}

/// A handler response together with its not-yet-applied writes.
pub struct Prepared {
    pub response: StoredResponse,
    writes: Option<Box<dyn DeferredWrites>>,
}

impl Prepared {
    pub fn new(response: StoredResponse) -> Self {
        Self {
            response,
            writes: None,
        }
    }

    pub fn with_writes(response: StoredResponse, writes: impl DeferredWrites + 'static) -> Self {
        Self {
            response,
            writes: Some(Box::new(writes)),
        }
    }

    /// Applies the deferred writes and hands back the response.
    pub fn commit(self) -> StoredResponse {
        if let Some(writes) = self.writes {
            writes.apply();
        }
        self.response
    }
}

impl From<StoredResponse> for Prepared {
    fn from(response: StoredResponse) -> Self {
        Self::new(response)
    }
}

impl fmt::Debug for Prepared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prepared")
            .field("response", &self.response)
            .field("has_writes", &self.writes.is_some())
            .finish()
    }
}

/// Response handed back to the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub response: StoredResponse,
    pub replayed: bool,
}

impl Outcome {
    fn fresh(response: StoredResponse) -> Self {
        Self {
            response,
            replayed: false,
        }
    }

    fn replayed(response: StoredResponse) -> Self {
        Self {
            response,
            replayed: true,
        }
    }
}

/// Only responses below the server-error range are ever replayed.
pub fn should_cache(status_code: u16) -> bool {
    status_code < 500
}

#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    settings: IdempotencySettings,
    metrics: Arc<Metrics>,
}

impl IdempotencyCoordinator {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        settings: IdempotencySettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            settings,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    pub fn settings(&self) -> &IdempotencySettings {
        &self.settings
    }

    pub async fn acquire(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<Acquisition, StoreError> {
        let inserted = match self.store.insert_pending(key, fingerprint, Utc::now()).await {
            Err(StoreError::Vanished { .. }) => {
                warn!(key = %key, "collided idempotency record vanished, retrying insert once");
                self.store.insert_pending(key, fingerprint, Utc::now()).await?
            }
            other => other?,
        };

        let acquisition = match inserted {
            InsertOutcome::Created => Acquisition::Proceed,
            InsertOutcome::AlreadyExists(existing) => {
                if !existing.matches(fingerprint) {
                    Acquisition::Conflict
                } else if let Some(stored) = existing.stored_response() {
                    Acquisition::Replay(stored)
                } else {
                    Acquisition::InProgress
                }
            }
        };

        let outcome = match &acquisition {
            Acquisition::Proceed => "proceed",
            Acquisition::Replay(_) => "replay",
            Acquisition::InProgress => "in_progress",
            Acquisition::Conflict => "conflict",
        };
        debug!(key = %key, route = %fingerprint.route, outcome, "idempotency key acquired");
        self.metrics.idempotency_outcome(outcome);
        Ok(acquisition)
    }

    /// Caches `response` under `key` and completes the record.
    ///
    /// Non-cacheable responses leave the record PENDING so a later retry
    /// executes again once the pending timeout reclaims it. A record that is
    /// no longer PENDING yields [`StoreError::NotPending`].
    pub async fn finalize(&self, key: &str, response: &StoredResponse) -> Result<(), StoreError> {
        if !should_cache(response.status_code) {
            debug!(key = %key, status = response.status_code, "response not cacheable, record left pending");
            return Ok(());
        }
        let completed = self
            .store
            .mark_completed(key, response.status_code, &response.body, Utc::now())
            .await?;
        if !completed {
            warn!(key = %key, "idempotency record was not pending at finalization");
            return Err(StoreError::NotPending {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Best-effort delete of a PENDING record whose handler failed.
    pub async fn release_on_error(&self, key: &str) {
        match self.store.delete_by_key(key).await {
            Ok(_) => {
                info!(key = %key, "idempotency key released after handler failure");
                self.metrics.idempotency_outcome("released");
            }
            Err(err) => {
                warn!(key = %key, error = %err, "failed to release idempotency key, reaper will reclaim it");
            }
        }
    }

    /// Polls until the record completes, disappears or the budget runs out.
    pub async fn wait_for_finalized(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<WaitOutcome, StoreError> {
        let deadline = Instant::now() + self.settings.wait_budget;
        loop {
            match self.store.get_by_key(key).await? {
                None => return Ok(WaitOutcome::Released),
                Some(record) if !record.matches(fingerprint) => return Ok(WaitOutcome::Conflict),
                Some(record) => {
                    if let Some(stored) = record.stored_response() {
                        return Ok(WaitOutcome::Completed(stored));
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::time::sleep(self.settings.wait_step.min(deadline - now)).await;
        }
    }

    fn contention(&self) -> ApiError {
        self.metrics.idempotency_outcome("contention");
        let secs = self.settings.wait_budget.as_millis().div_ceil(1000) as u64;
        ApiError::IdempotencyInProgress {
            retry_after_secs: secs.max(1),
        }
    }

    /// Runs `handler` at most once per key.
    ///
    /// Without a key the handler runs unconditionally. With a key, the
    /// protected execution is detached from the caller so a dropped client
    /// connection cannot leave a committed operation unfinalized.
    /// Client errors returned by the handler are cached like successes;
    /// server errors release the key and propagate. A key released by its
    /// owner while this caller waited is acquired once more.
    pub async fn execute<F, Fut>(
        &self,
        key: Option<String>,
        fingerprint: RequestFingerprint,
        handler: F,
    ) -> Result<Outcome, ApiError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Prepared, ApiError>> + Send + 'static,
    {
        let Some(key) = key else {
            return resolve_client_errors(handler().await)
                .map(|prepared| Outcome::fresh(prepared.commit()));
        };

        let mut reacquired = false;
        loop {
            match self.acquire(&key, &fingerprint).await? {
                Acquisition::Proceed => break,
                Acquisition::Replay(stored) => return Ok(Outcome::replayed(stored)),
                Acquisition::Conflict => return Err(ApiError::IdempotencyConflict),
                Acquisition::InProgress => match self.wait_for_finalized(&key, &fingerprint).await? {
                    WaitOutcome::Completed(stored) => {
                        self.metrics.idempotency_outcome("waited_replay");
                        return Ok(Outcome::replayed(stored));
                    }
                    WaitOutcome::Conflict => return Err(ApiError::IdempotencyConflict),
                    WaitOutcome::Released if !reacquired => {
                        debug!(key = %key, "idempotency key released while waiting, acquiring again");
                        reacquired = true;
                    }
                    WaitOutcome::Released | WaitOutcome::TimedOut => return Err(self.contention()),
                },
            }
        }

        let coordinator = self.clone();
        let owned_key = key.clone();
        let task = tokio::spawn(
            async move { coordinator.run_owned(&owned_key, handler).await }.in_current_span(),
        );
        match task.await {
            Ok(result) => result.map(Outcome::fresh),
            Err(join_err) => {
                error!(key = %key, error = %join_err, "protected handler aborted");
                self.release_on_error(&key).await;
                Err(ApiError::Internal(format!("handler aborted: {join_err}")))
            }
        }
    }

    async fn run_owned<F, Fut>(&self, key: &str, handler: F) -> Result<StoredResponse, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Prepared, ApiError>>,
    {
        let prepared = match resolve_client_errors(handler().await) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.release_on_error(key).await;
                return Err(err);
            }
        };

        match self.finalize(key, &prepared.response).await {
            Ok(()) => Ok(prepared.commit()),
            Err(err) => {
                error!(key = %key, error = %err, "failed to finalize idempotency record, discarding writes");
                drop(prepared);
                // Someone else may own the key by now.
                if !matches!(err, StoreError::NotPending { .. }) {
                    self.release_on_error(key).await;
                }
                Err(err.into())
            }
        }
    }
}

/// Turns client-visible handler rejections into ordinary responses.
fn resolve_client_errors(result: Result<Prepared, ApiError>) -> Result<Prepared, ApiError> {
    match result {
        Err(err) if err.status().is_client_error() => Ok(Prepared::new(StoredResponse {
            status_code: err.status().as_u16(),
            body: err.body(),
        })),
        other => other,
    }
}
