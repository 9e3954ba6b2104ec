//! Supervisor: wires every component together, owns the shutdown broadcast,
//! forwards Watcher fill notifications into the OCO Manager, and exposes the
//! manual control surface (§6) operators drive the system through. Adapted
//! from this codebase's `OrderManagementSystem` wiring/metrics split.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::broker::BrokerAdapter;
use crate::clock::Clock;
use crate::config::Config;
use crate::domain::{BatchItem, BatchJob, BatchStatus};
use crate::engine::ExecutionEngine;
use crate::eod::EodCloser;
use crate::error::ControllerResult;
use crate::oco::OcoManager;
use crate::ratelimit::RateLimiter;
use crate::recovery::RecoveryManager;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::watcher::Watcher;

/// Counters surfaced to operators; mirrors the shape of the teacher's
/// atomics-based metrics struct rather than pulling in a metrics crate.
#[derive(Debug, Default)]
pub struct Metrics {
    pub batches_started: AtomicU64,
    pub items_submitted: AtomicU64,
    pub brackets_emitted: AtomicU64,
    pub items_closed: AtomicU64,
    pub items_errored: AtomicU64,
    pub manual_commands: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub batches_started: u64,
    pub items_submitted: u64,
    pub brackets_emitted: u64,
    pub items_closed: u64,
    pub items_errored: u64,
    pub manual_commands: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_started: self.batches_started.load(Ordering::Relaxed),
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            brackets_emitted: self.brackets_emitted.load(Ordering::Relaxed),
            items_closed: self.items_closed.load(Ordering::Relaxed),
            items_errored: self.items_errored.load(Ordering::Relaxed),
            manual_commands: self.manual_commands.load(Ordering::Relaxed),
        }
    }
}

pub struct Supervisor {
    store: Arc<Store>,
    audit: Arc<AuditTrail>,
    broker: Arc<dyn BrokerAdapter>,
    scheduler: Arc<Scheduler>,
    engine: Arc<ExecutionEngine>,
    watcher: Arc<Watcher>,
    oco: Arc<OcoManager>,
    eod: Arc<EodCloser>,
    recovery: Arc<RecoveryManager>,
    metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        audit: Arc<AuditTrail>,
        broker: Arc<dyn BrokerAdapter>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_order_per_sec, config.rate_info_per_sec));
        let scheduler = Arc::new(Scheduler::new(store.clone(), audit.clone(), clock.clone(), config));
        let engine = Arc::new(ExecutionEngine::new(store.clone(), broker.clone(), rate_limiter.clone(), audit.clone()));
        let watcher = Arc::new(Watcher::new(store.clone(), broker.clone(), rate_limiter.clone(), audit.clone(), config));
        let oco = Arc::new(OcoManager::new(store.clone(), broker.clone(), rate_limiter.clone(), audit.clone(), config));
        let eod = Arc::new(EodCloser::new(store.clone(), broker.clone(), rate_limiter.clone(), audit.clone(), clock, config));
        let recovery = Arc::new(RecoveryManager::new(store.clone(), broker.clone(), rate_limiter, audit.clone()));
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            store,
            audit,
            broker,
            scheduler,
            engine,
            watcher,
            oco,
            eod,
            recovery,
            metrics: Arc::new(Metrics::default()),
            shutdown_tx,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Runs startup reconciliation, then spawns the Scheduler, Watcher, EOD
    /// Closer loops and the fill-notification relay, returning once
    /// `shutdown()` is called.
    pub async fn run(self: Arc<Self>) -> ControllerResult<()> {
        self.broker.authenticate().await?;
        let stats = self.recovery.recover().await?;
        info!(discrepancies = stats.discrepancies_found, "startup reconciliation done");

        let (entry_tx, mut entry_rx) = mpsc::unbounded_channel::<Uuid>();
        let (leg_tx, mut leg_rx) = mpsc::unbounded_channel::<Uuid>();

        let watcher = self.watcher.clone();
        let watcher_shutdown = self.shutdown_tx.subscribe();
        let watcher_task = tokio::spawn(async move {
            watcher.run(entry_tx, leg_tx, watcher_shutdown).await;
        });

        let oco = self.oco.clone();
        let metrics = self.metrics.clone();
        let fill_relay_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(item_id) = entry_rx.recv() => {
                        if let Err(e) = oco.on_fill(item_id).await {
                            warn!(item_id = %item_id, error = %e, "oco on_fill failed");
                        } else {
                            metrics.brackets_emitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Some(order_id) = leg_rx.recv() => {
                        if let Err(e) = oco.on_leg_filled(order_id).await {
                            warn!(order_id = %order_id, error = %e, "oco on_leg_filled failed");
                        } else {
                            metrics.items_closed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    else => break,
                }
            }
        });

        let scheduler = self.scheduler.clone();
        let scheduler_shutdown = self.shutdown_tx.subscribe();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<Uuid>();
        let scheduler_task = tokio::spawn(async move {
            scheduler.run(started_tx, scheduler_shutdown).await;
        });
        let metrics_for_started = self.metrics.clone();
        let started_drain_task = tokio::spawn(async move {
            while let Some(_batch_id) = started_rx.recv().await {
                metrics_for_started.batches_started.fetch_add(1, Ordering::Relaxed);
            }
        });

        let eod = self.eod.clone();
        let mut eod_shutdown = self.shutdown_tx.subscribe();
        let eod_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = eod.tick().await {
                            warn!(error = %e, "eod tick failed");
                        }
                    }
                    _ = eod_shutdown.recv() => break,
                }
            }
        });

        let engine = self.engine.clone();
        let store = self.store.clone();
        let mut engine_shutdown = self.shutdown_tx.subscribe();
        let engine_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Ok(batches) = store.running_batches().await {
                            for batch in batches {
                                if batch.status == BatchStatus::Running {
                                    if let Err(e) = engine.run(batch.id).await {
                                        warn!(batch_id = %batch.id, error = %e, "execution engine pass failed");
                                    }
                                }
                            }
                        }
                    }
                    _ = engine_shutdown.recv() => break,
                }
            }
        });

        let _ = tokio::join!(
            watcher_task,
            fill_relay_task,
            scheduler_task,
            started_drain_task,
            eod_task,
            engine_task,
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    // --- Manual control surface (§6) ---

    pub async fn create_batch(&self, job: &BatchJob, items: &[BatchItem]) -> ControllerResult<()> {
        self.store.insert_batch_job(job).await?;
        for item in items {
            self.store.insert_batch_item(item).await?;
        }
        self.audit
            .log_manual_command("operator", "create_batch", Some(job.id), None, None)
            .await?;
        self.metrics.manual_commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn pause_batch(&self, batch_id: Uuid, reason: Option<&str>) -> ControllerResult<()> {
        let mut batch = self.store.get_batch_job(batch_id).await?;
        batch.status = BatchStatus::Paused;
        self.store.update_batch_job(&batch).await?;
        self.audit
            .log_manual_command("operator", "pause_batch", Some(batch_id), None, reason)
            .await?;
        self.metrics.manual_commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn resume_batch(&self, batch_id: Uuid, reason: Option<&str>) -> ControllerResult<()> {
        let mut batch = self.store.get_batch_job(batch_id).await?;
        batch.status = BatchStatus::Running;
        self.store.update_batch_job(&batch).await?;
        self.audit
            .log_manual_command("operator", "resume_batch", Some(batch_id), None, reason)
            .await?;
        self.metrics.manual_commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn cancel_batch(&self, batch_id: Uuid, reason: Option<&str>) -> ControllerResult<()> {
        let mut batch = self.store.get_batch_job(batch_id).await?;
        batch.status = BatchStatus::Cancelled;
        self.store.update_batch_job(&batch).await?;
        for item in self.store.items_for_batch(batch_id).await? {
            if !item.status.is_terminal() {
                self.eod.force_close_item(&item).await?;
            }
        }
        self.audit
            .log_manual_command("operator", "cancel_batch", Some(batch_id), None, reason)
            .await?;
        self.metrics.manual_commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn force_close_item(&self, item_id: Uuid, reason: Option<&str>) -> ControllerResult<()> {
        let item = self.store.get_item(item_id).await?;
        self.eod.force_close_item(&item).await?;
        self.audit
            .log_manual_command("operator", "force_close_item", Some(item.batch_id), Some(item_id), reason)
            .await?;
        self.metrics.manual_commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Force-closes every non-terminal item across every running/paused
    /// batch. The last-resort manual command; reuses the EOD Closer's
    /// cancel-then-flatten algorithm outside its scheduled trigger.
    pub async fn panic_stop_all(&self, reason: Option<&str>) -> ControllerResult<()> {
        warn!(reason, "panic_stop_all invoked");
        for batch in self.store.running_batches().await? {
            for item in self.store.items_for_batch(batch.id).await? {
                if !item.status.is_terminal() {
                    self.eod.force_close_item(&item).await?;
                    self.metrics.items_closed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.audit
            .log_manual_command("operator", "panic_stop_all", None, None, reason)
            .await?;
        self.metrics.manual_commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
