//! Execution Engine: submits entry orders for a `RUNNING` batch's `READY`
//! items, in stable order, one order-class rate-limiter token at a time
//! (§4.2). Adapted from this codebase's `create_order`/`submit_order` pair.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditTrail, EventLevel};
use crate::broker::{BrokerAdapter, OrderPayload};
use crate::domain::{ItemStatus, Order, OrderRole, OrderStatus, OrderType};
use crate::error::ControllerResult;
use crate::ratelimit::{RateLimiter, TrafficClass};
use crate::store::{Store, UpdateOutcome};
use crate::types::Qty;

pub struct ExecutionEngine {
    store: Arc<Store>,
    broker: Arc<dyn BrokerAdapter>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditTrail>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<dyn BrokerAdapter>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            store,
            broker,
            rate_limiter,
            audit,
        }
    }

    pub async fn run(&self, batch_id: Uuid) -> ControllerResult<()> {
        let items = self.store.items_for_batch(batch_id).await?;
        for item in items {
            if item.status != ItemStatus::Ready {
                // Already submitted (or terminal) on a prior pass; restart-safe.
                continue;
            }
            self.submit_entry(item.id).await?;
        }
        Ok(())
    }

    async fn submit_entry(&self, item_id: Uuid) -> ControllerResult<()> {
        let item = self.store.get_item(item_id).await?;
        if item.status != ItemStatus::Ready {
            return Ok(());
        }

        self.rate_limiter.acquire(TrafficClass::Order).await;

        let payload = OrderPayload {
            client_ref: item.id.to_string(),
            symbol: item.symbol,
            market: item.market,
            side: item.side,
            qty: item.qty,
            order_type: match item.entry_type {
                crate::domain::EntryType::Market => OrderType::Market,
                crate::domain::EntryType::Limit => OrderType::Limit,
            },
            price: item.entry_price,
            stop_trigger: None,
        };

        match self.broker.send_order(payload).await {
            Ok(broker_order_id) => {
                let order = Order {
                    id: Uuid::new_v4(),
                    item_id: item.id,
                    role: OrderRole::Entry,
                    broker_order_id: Some(broker_order_id.clone()),
                    side: item.side,
                    qty: item.qty,
                    order_type: match item.entry_type {
                        crate::domain::EntryType::Market => OrderType::Market,
                        crate::domain::EntryType::Limit => OrderType::Limit,
                    },
                    price: item.entry_price,
                    stop_trigger: None,
                    status: OrderStatus::Working,
                    cum_qty: Qty::ZERO,
                    avg_price: crate::types::Px::ZERO,
                    submitted_at: Utc::now(),
                    last_polled_at: None,
                    version: 0,
                };
                self.store.insert_order(&order).await?;

                let mut updated = item.clone();
                updated.status = ItemStatus::EntrySent;
                updated.entry_order_id = Some(order.id);
                if self.store.update_item(&updated).await? == UpdateOutcome::Stale {
                    warn!(item_id = %item.id, "lost race updating item after entry submit");
                }

                self.audit
                    .log_event(
                        EventLevel::Info,
                        "engine",
                        Some(item.id),
                        Some(item.batch_id),
                        "entry order sent",
                        serde_json::json!({"broker_order_id": broker_order_id}),
                    )
                    .await?;
                info!(item_id = %item.id, broker_order_id, "entry sent");
            }
            Err(e) => {
                let mut updated = item.clone();
                updated.status = ItemStatus::Error;
                updated.last_error = Some(e.to_string());
                self.store.update_item(&updated).await?;

                self.audit
                    .log_event(
                        EventLevel::Error,
                        "engine",
                        Some(item.id),
                        Some(item.batch_id),
                        "entry order rejected",
                        serde_json::json!({"error": e.to_string()}),
                    )
                    .await?;
                warn!(item_id = %item.id, error = %e, "entry rejected, continuing with next item");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerAdapter;
    use crate::domain::*;
    use crate::types::{MarketCode, Px, Symbol};

    async fn store_with_item(status: ItemStatus) -> (Arc<Store>, BatchItem) {
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
            symbol: Symbol(9432),
            market: MarketCode(1),
            product: Product::Cash,
            side: Side::Buy,
            qty: Qty::from_units(100),
            entry_type: EntryType::Market,
            entry_price: None,
            tp_price: Px::new(1000.0),
            sl_trigger_price: Px::new(900.0),
            status,
            filled_qty: Qty::ZERO,
            avg_fill_price: Px::ZERO,
            entry_order_id: None,
            last_error: None,
            version: 0,
        };
        store.insert_batch_item(&item).await.unwrap();
        (store, item)
    }

    #[tokio::test]
    async fn successful_submit_moves_item_to_entry_sent() {
        let (store, item) = store_with_item(ItemStatus::Ready).await;
        let mut broker = MockBrokerAdapter::new();
        broker
            .expect_send_order()
            .returning(|_| Box::pin(async { Ok("BRK-1".to_string()) }));
        let rate_limiter = Arc::new(RateLimiter::new(100, 100));
        let audit_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let audit = Arc::new(AuditTrail::new(audit_pool).await.unwrap());
        let engine = ExecutionEngine::new(store.clone(), Arc::new(broker), rate_limiter, audit);

        engine.run(item.batch_id).await.unwrap();

        let updated = store.get_item(item.id).await.unwrap();
        assert_eq!(updated.status, ItemStatus::EntrySent);
        assert!(updated.entry_order_id.is_some());
    }

    #[tokio::test]
    async fn rejected_submit_marks_item_error_without_aborting() {
        let (store, item) = store_with_item(ItemStatus::Ready).await;
        let mut broker = MockBrokerAdapter::new();
        broker.expect_send_order().returning(|_| {
            Box::pin(async {
                Err(crate::error::ControllerError::BrokerRejected {
                    reason: "insufficient margin".into(),
                })
            })
        });
        let rate_limiter = Arc::new(RateLimiter::new(100, 100));
        let audit_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let audit = Arc::new(AuditTrail::new(audit_pool).await.unwrap());
        let engine = ExecutionEngine::new(store.clone(), Arc::new(broker), rate_limiter, audit);

        engine.run(item.batch_id).await.unwrap();

        let updated = store.get_item(item.id).await.unwrap();
        assert_eq!(updated.status, ItemStatus::Error);
    }

    #[tokio::test]
    async fn already_sent_item_is_not_resubmitted() {
        let (store, item) = store_with_item(ItemStatus::EntrySent).await;
        let mut broker = MockBrokerAdapter::new();
        broker.expect_send_order().times(0);
        let rate_limiter = Arc::new(RateLimiter::new(100, 100));
        let audit_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let audit = Arc::new(AuditTrail::new(audit_pool).await.unwrap());
        let engine = ExecutionEngine::new(store.clone(), Arc::new(broker), rate_limiter, audit);

        engine.run(item.batch_id).await.unwrap();
    }
}
