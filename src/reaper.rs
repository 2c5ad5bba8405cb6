//! Periodic removal of expired idempotency records.

use crate::config::IdempotencySettings;
use crate::idempotency::{IdempotencyStore, StoreError};
use crate::metrics::Metrics;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Deletes COMPLETED records older than the retention window and PENDING
/// records that stopped updating before the pending timeout.
pub async fn sweep_once(
    store: &dyn IdempotencyStore,
    settings: &IdempotencySettings,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let completed_before = cutoff(now, settings.completed_ttl);
    let pending_before = cutoff(now, settings.pending_ttl);
    store.delete_expired(completed_before, pending_before).await
}

fn cutoff(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct IdempotencyReaper;

impl IdempotencyReaper {
    /// Spawns the sweep loop. The first sweep runs immediately.
    pub fn start(
        store: Arc<dyn IdempotencyStore>,
        settings: IdempotencySettings,
        metrics: Arc<Metrics>,
    ) -> ReaperHandle {
        let interval = if settings.sweep_interval.is_zero() {
            Duration::from_millis(1)
        } else {
            settings.sweep_interval
        };
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                match sweep_once(store.as_ref(), &settings, Utc::now()).await {
                    Ok(0) => debug!("idempotency sweep found nothing to delete"),
                    Ok(count) => {
                        metrics.reaped(count);
                        info!(count, "expired idempotency records deleted");
                    }
                    Err(err) => warn!(error = %err, "idempotency sweep failed"),
                }
            }
            debug!("idempotency reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signals the loop and waits for an in-flight sweep to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "idempotency reaper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::{InMemoryIdempotencyStore, RequestFingerprint};
    use serde_json::json;

    fn settings() -> IdempotencySettings {
        IdempotencySettings::new(Some(7), Some(60_000), Some(20), None, None)
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_records_and_drops_stale_ones() {
        let store = InMemoryIdempotencyStore::new();
        let fp = RequestFingerprint::new("POST", "/payments/pix", "h");
        let now = Utc::now();

        store.insert_pending("stale-pending", &fp, now - TimeDelta::minutes(5)).await.unwrap();
        store.insert_pending("fresh-pending", &fp, now).await.unwrap();
        store.insert_pending("old-done", &fp, now - TimeDelta::days(8)).await.unwrap();
        store
            .mark_completed("old-done", 201, &json!({}), now - TimeDelta::days(8))
            .await
            .unwrap();
        store.insert_pending("new-done", &fp, now - TimeDelta::days(1)).await.unwrap();
        store.mark_completed("new-done", 201, &json!({}), now).await.unwrap();

        let deleted = sweep_once(&store, &settings(), now).await.unwrap();

        assert_eq!(deleted, 2);
        assert!(store.get_by_key("stale-pending").await.unwrap().is_none());
        assert!(store.get_by_key("old-done").await.unwrap().is_none());
        assert!(store.get_by_key("fresh-pending").await.unwrap().is_some());
        assert!(store.get_by_key("new-done").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn background_loop_sweeps_and_stops() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let fp = RequestFingerprint::new("POST", "/payments/pix", "h");
        store
            .insert_pending("stale", &fp, Utc::now() - TimeDelta::minutes(10))
            .await
            .unwrap();
        let metrics = Arc::new(Metrics::new());

        let handle = IdempotencyReaper::start(store.clone(), settings(), Arc::clone(&metrics));
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;

        assert_eq!(store.size(), 0);
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("idempotency_reaped_records_total 1"));
    }

    #[test]
    fn oversized_ttl_saturates_at_the_earliest_instant() {
        let now = Utc::now();
        assert_eq!(cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(cutoff(now, Duration::from_secs(60)), now - TimeDelta::seconds(60));
    }
}
