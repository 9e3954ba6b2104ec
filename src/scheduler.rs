//! Scheduler: flips `SCHEDULED` batches to `RUNNING` at their appointed
//! time, and expires batches whose fire time is too far in the past
//! (§4.1's missed-fire policy).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::audit::{AuditTrail, EventLevel};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::ControllerResult;
use crate::store::{Store, UpdateOutcome};

pub struct Scheduler {
    store: Arc<Store>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
    miss_grace: Duration,
    tick_period: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            miss_grace: config.scheduler_miss_grace,
            tick_period: Duration::from_secs(1),
        }
    }

    /// One scan over `SCHEDULED` batches. Returns the ids of batches this
    /// call transitioned to `RUNNING`, for the caller to hand to the
    /// Execution Engine.
    pub async fn tick(&self) -> ControllerResult<Vec<uuid::Uuid>> {
        let now = self.clock.now();
        let due = self.store.due_batches(now).await?;
        let mut started = Vec::new();

        for batch in due {
            let scheduled_at = match batch.scheduled_at {
                Some(t) => t,
                None => continue,
            };
            let age = now.signed_duration_since(scheduled_at);
            if age > chrono::Duration::from_std(self.miss_grace).unwrap_or_default() {
                self.store
                    .mark_batch_missed(batch.id, "missed scheduler grace window")
                    .await?;
                self.audit
                    .log_event(
                        EventLevel::Error,
                        "scheduler",
                        None,
                        Some(batch.id),
                        "batch missed its scheduled start and grace window",
                        serde_json::json!({"scheduled_at": scheduled_at.to_rfc3339()}),
                    )
                    .await?;
                warn!(batch_id = %batch.id, "batch missed fire, marked ERROR");
                continue;
            }

            match self.store.try_start_batch(batch.id, batch.version, now).await? {
                UpdateOutcome::Applied => {
                    info!(batch_id = %batch.id, "batch started");
                    started.push(batch.id);
                }
                UpdateOutcome::Stale => {
                    // Another scheduler tick (or a manual command) won the race.
                }
            }
        }

        self.store
            .record_scheduler_run(started.len() as i64, "ok")
            .await?;
        Ok(started)
    }

    /// Runs the tick loop until `shutdown` fires, forwarding newly started
    /// batch ids on `on_started`.
    pub async fn run(
        &self,
        on_started: tokio::sync::mpsc::UnboundedSender<uuid::Uuid>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(self.tick_period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(started) => {
                            for id in started {
                                let _ = on_started.send(id);
                            }
                        }
                        Err(e) => warn!(error = %e, "scheduler tick failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::domain::BatchStatus;
    use chrono::Utc;
    use uuid::Uuid;

    async fn fixture(now: chrono::DateTime<Utc>) -> (Scheduler, Arc<Store>) {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let pool_audit = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let audit = Arc::new(AuditTrail::new(pool_audit).await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(now));
        let config = Config::default();
        (Scheduler::new(store.clone(), audit, clock, &config), store)
    }

    #[tokio::test]
    async fn due_batch_transitions_to_running() {
        let now = Utc::now();
        let (scheduler, store) = fixture(now).await;
        let job = crate::domain::BatchJob {
            id: Uuid::new_v4(),
            batch_code: "B1".into(),
            scheduled_at: Some(now - chrono::Duration::seconds(1)),
            eod_close_hour: 14,
            eod_close_minute: 30,
            eod_force_close: true,
            status: BatchStatus::Scheduled,
            started_at: None,
            finished_at: None,
            last_error: None,
            version: 0,
        };
        store.insert_batch_job(&job).await.unwrap();

        let started = scheduler.tick().await.unwrap();
        assert_eq!(started, vec![job.id]);
    }

    #[tokio::test]
    async fn stale_scheduled_batch_is_marked_error_not_started() {
        let now = Utc::now();
        let (scheduler, store) = fixture(now).await;
        let job = crate::domain::BatchJob {
            id: Uuid::new_v4(),
            batch_code: "B2".into(),
            scheduled_at: Some(now - chrono::Duration::seconds(600)),
            eod_close_hour: 14,
            eod_close_minute: 30,
            eod_force_close: true,
            status: BatchStatus::Scheduled,
            started_at: None,
            finished_at: None,
            last_error: None,
            version: 0,
        };
        store.insert_batch_job(&job).await.unwrap();

        let started = scheduler.tick().await.unwrap();
        assert!(started.is_empty());
    }
}
