//! EOD Closer: force-flattens any item still open at the configured
//! wall-clock time (§4.6), and backs the Supervisor's panic-stop command
//! with the same algorithm run out-of-schedule.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditTrail, EventLevel};
use crate::broker::{BrokerAdapter, OrderPayload};
use crate::clock::{past_local_time, Clock};
use crate::config::Config;
use crate::domain::{
    BatchItem, BatchStatus, ItemStatus, Order, OrderRole, OrderStatus, OrderType, OcoGroupStatus,
};
use crate::error::ControllerResult;
use crate::ratelimit::{RateLimiter, TrafficClass};
use crate::store::Store;
use crate::types::{Px, Qty};

pub struct EodCloser {
    store: Arc<Store>,
    broker: Arc<dyn BrokerAdapter>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl EodCloser {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<dyn BrokerAdapter>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            broker,
            rate_limiter,
            audit,
            clock,
            enabled: config.eod_enabled,
        }
    }

    /// Scans running/paused batches and force-closes items whose parent
    /// batch has crossed its configured EOD close time.
    pub async fn tick(&self) -> ControllerResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let now = self.clock.now();
        for batch in self.store.running_batches().await? {
            if batch.status != BatchStatus::Running && batch.status != BatchStatus::Paused {
                continue;
            }
            if !batch.eod_force_close {
                continue;
            }
            if !past_local_time(now, batch.eod_close_hour, batch.eod_close_minute) {
                continue;
            }
            for item in self.store.items_for_batch(batch.id).await? {
                if item.status.is_terminal() {
                    continue;
                }
                self.force_close_item(&item).await?;
            }
        }
        Ok(())
    }

    /// Cancels every open order for the item, then flattens any residual
    /// position with a market order. Used both by the scheduled EOD pass
    /// and by the Supervisor's manual `panic_stop_all`/`force_close_item`.
    pub async fn force_close_item(&self, item: &BatchItem) -> ControllerResult<()> {
        let orders = self.store.orders_for_item(item.id).await?;
        for order in orders.iter().filter(|o| !o.status.is_terminal()) {
            if let Some(broker_id) = &order.broker_order_id {
                self.rate_limiter.acquire(TrafficClass::Order).await;
                match self.broker.cancel_order(broker_id).await {
                    Ok(()) => {
                        let mut cancelled = order.clone();
                        cancelled.status = OrderStatus::Cancelled;
                        self.store.update_order(&cancelled).await?;
                    }
                    Err(e) => warn!(order_id = %order.id, error = %e, "eod cancel failed"),
                }
            }
        }

        let groups = self.store.groups_for_item(item.id).await?;
        let closed_by_oco: Qty = groups
            .iter()
            .filter(|g| g.status == OcoGroupStatus::Closed)
            .fold(Qty::ZERO, |acc, g| acc.add(g.qty));
        let residual = item.filled_qty.sub(closed_by_oco);

        if residual.is_zero() || residual.raw() < 0 {
            self.finish_close(item, ItemStatus::Closed).await?;
            return Ok(());
        }

        let close_side = item.side.inverted();
        let payload = OrderPayload {
            client_ref: format!("{}-eod", item.id),
            symbol: item.symbol,
            market: item.market,
            side: close_side,
            qty: residual,
            order_type: OrderType::Market,
            price: None,
            stop_trigger: None,
        };

        self.rate_limiter.acquire(TrafficClass::Order).await;
        match self.broker.send_order(payload).await {
            Ok(broker_order_id) => {
                let order = Order {
                    id: Uuid::new_v4(),
                    item_id: item.id,
                    role: OrderRole::Eod,
                    broker_order_id: Some(broker_order_id),
                    side: close_side,
                    qty: residual,
                    order_type: OrderType::Market,
                    price: None,
                    stop_trigger: None,
                    status: OrderStatus::Working,
                    cum_qty: Qty::ZERO,
                    avg_price: Px::ZERO,
                    submitted_at: Utc::now(),
                    last_polled_at: None,
                    version: 0,
                };
                self.store.insert_order(&order).await?;
                self.finish_close(item, ItemStatus::EodMarketSent).await?;
                info!(item_id = %item.id, "eod market close sent");
            }
            Err(e) => {
                let mut updated = item.clone();
                updated.status = ItemStatus::Error;
                updated.last_error = Some(format!("EOD_FAILED: {e}"));
                self.store.update_item(&updated).await?;
                self.audit
                    .log_event(
                        EventLevel::Error,
                        "eod",
                        Some(item.id),
                        Some(item.batch_id),
                        "eod close failed",
                        serde_json::json!({"error": e.to_string()}),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn finish_close(&self, item: &BatchItem, status: ItemStatus) -> ControllerResult<()> {
        let mut updated = item.clone();
        updated.status = status;
        self.store.update_item(&updated).await?;
        self.audit
            .log_event(
                EventLevel::Info,
                "eod",
                Some(item.id),
                Some(item.batch_id),
                "item force-closed",
                serde_json::json!({"status": format!("{status:?}")}),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerAdapter;
    use crate::clock::FixedClock;
    use crate::domain::*;
    use crate::types::{MarketCode, Symbol};
    use chrono::TimeZone;

    async fn fixture(filled: Qty, status: ItemStatus) -> (Arc<Store>, BatchItem, BatchJob) {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let job = BatchJob {
            id: Uuid::new_v4(),
            batch_code: "B1".into(),
            scheduled_at: None,
            eod_close_hour: 14,
            eod_close_minute: 30,
            eod_force_close: true,
            status: BatchStatus::Running,
            started_at: Some(Utc::now()),
            finished_at: None,
            last_error: None,
            version: 0,
        };
        store.insert_batch_job(&job).await.unwrap();
        let item = BatchItem {
            id: Uuid::new_v4(),
            batch_id: job.id,
            symbol: Symbol(1),
            market: MarketCode(1),
            product: Product::Cash,
            side: Side::Buy,
            qty: Qty::from_units(100),
            entry_type: EntryType::Market,
            entry_price: None,
            tp_price: Px::new(1000.0),
            sl_trigger_price: Px::new(900.0),
            status,
            filled_qty: filled,
            avg_fill_price: Px::new(950.0),
            entry_order_id: None,
            last_error: None,
            version: 0,
        };
        store.insert_batch_item(&item).await.unwrap();
        (store, item, job)
    }

    #[tokio::test]
    async fn force_close_with_residual_sends_market_order() {
        let (store, item, _job) = fixture(Qty::from_units(100), ItemStatus::BracketSent).await;
        let mut broker = MockBrokerAdapter::new();
        broker
            .expect_send_order()
            .returning(|_| Box::pin(async { Ok("BRK-EOD".to_string()) }));
        let rate_limiter = Arc::new(RateLimiter::new(100, 100));
        let audit_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let audit = Arc::new(AuditTrail::new(audit_pool).await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap()));
        let config = Config::default();
        let closer = EodCloser::new(store.clone(), Arc::new(broker), rate_limiter, audit, clock, &config);

        closer.force_close_item(&item).await.unwrap();

        let updated = store.get_item(item.id).await.unwrap();
        assert_eq!(updated.status, ItemStatus::EodMarketSent);
    }

    #[tokio::test]
    async fn force_close_with_no_residual_closes_immediately() {
        let (store, item, _job) = fixture(Qty::ZERO, ItemStatus::Ready).await;
        let broker = MockBrokerAdapter::new();
        let rate_limiter = Arc::new(RateLimiter::new(100, 100));
        let audit_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let audit = Arc::new(AuditTrail::new(audit_pool).await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(Utc::now()));
        let config = Config::default();
        let closer = EodCloser::new(store.clone(), Arc::new(broker), rate_limiter, audit, clock, &config);

        closer.force_close_item(&item).await.unwrap();

        let updated = store.get_item(item.id).await.unwrap();
        assert_eq!(updated.status, ItemStatus::Closed);
    }
}
