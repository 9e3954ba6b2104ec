//! Watcher: periodically polls the broker for order and position state and
//! reconciles it into the durable store (§4.4). This is the only component
//! that ever learns about fills — everything downstream (OCO Manager, EOD
//! Closer) reacts to the state it writes here, not to the broker directly.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditTrail, EventLevel};
use crate::broker::BrokerAdapter;
use crate::config::Config;
use crate::domain::{Fill, ItemLifecycle, ItemStatus, Order, OrderStatus};
use crate::error::ControllerResult;
use crate::ratelimit::{RateLimiter, TrafficClass};
use crate::store::{Store, UpdateOutcome};

#[derive(Debug, Default)]
pub struct PollOutcome {
    pub entry_fills: Vec<Uuid>,
    pub leg_fills: Vec<Uuid>,
}

pub struct Watcher {
    store: Arc<Store>,
    broker: Arc<dyn BrokerAdapter>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditTrail>,
    lifecycle: ItemLifecycle,
    orders_period: std::time::Duration,
    positions_period: std::time::Duration,
}

impl Watcher {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<dyn BrokerAdapter>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditTrail>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            broker,
            rate_limiter,
            audit,
            lifecycle: ItemLifecycle::new(),
            orders_period: config.poll_orders_interval,
            positions_period: config.poll_positions_interval,
        }
    }

    /// One order-poll pass. Reports which items gained entry fills (to
    /// trigger bracket emission) and which TP/SL leg orders newly reached
    /// `Filled` (to trigger mutual cancellation).
    pub async fn poll_orders(&self) -> ControllerResult<PollOutcome> {
        self.rate_limiter.acquire(TrafficClass::Info).await;
        let broker_orders = self.broker.list_orders().await?;
        let open_orders = self.store.open_orders().await?;

        let known_broker_ids: HashSet<&str> = open_orders
            .iter()
            .filter_map(|o| o.broker_order_id.as_deref())
            .collect();

        let mut touched_items = Vec::new();
        let mut filled_legs = Vec::new();

        for local in &open_orders {
            let Some(broker_id) = local.broker_order_id.as_deref() else {
                continue;
            };
            let Some(remote) = broker_orders.iter().find(|r| r.broker_order_id == broker_id) else {
                continue;
            };

            let delta = remote.cum_qty.sub(local.cum_qty);
            if !delta.is_zero() && local.role == crate::domain::OrderRole::Entry {
                let fill = Fill {
                    id: Uuid::new_v4(),
                    order_id: local.id,
                    qty: delta,
                    price: remote.avg_price,
                    filled_at: chrono::Utc::now(),
                };
                self.store.insert_fill(&fill).await?;
                self.apply_fill_to_item(local, delta, remote.avg_price).await?;
                touched_items.push(local.item_id);
            }

            let newly_filled = remote.status == OrderStatus::Filled && local.status != OrderStatus::Filled;
            if newly_filled
                && matches!(local.role, crate::domain::OrderRole::Tp | crate::domain::OrderRole::Sl)
            {
                filled_legs.push(local.id);
            }
            if newly_filled && local.role == crate::domain::OrderRole::Eod {
                self.close_item_on_eod_fill(local).await?;
            }

            if remote.status != local.status || !delta.is_zero() {
                let mut updated = local.clone();
                updated.status = remote.status;
                updated.cum_qty = remote.cum_qty;
                updated.avg_price = remote.avg_price;
                updated.last_polled_at = Some(chrono::Utc::now());
                if self.store.update_order(&updated).await? == UpdateOutcome::Stale {
                    warn!(order_id = %local.id, "lost race updating order from poll");
                }
            }
        }

        // Orphan detection: broker orders from this session not known locally.
        for remote in &broker_orders {
            if !known_broker_ids.contains(remote.broker_order_id.as_str())
                && self
                    .store
                    .find_order_by_broker_id(&remote.broker_order_id)
                    .await?
                    .is_none()
            {
                warn!(broker_order_id = %remote.broker_order_id, "orphan broker order not tracked locally");
                self.audit
                    .log_event(
                        EventLevel::Warn,
                        "watcher",
                        None,
                        None,
                        "orphan broker order observed",
                        serde_json::json!({"broker_order_id": remote.broker_order_id}),
                    )
                    .await?;
            }
        }

        Ok(PollOutcome {
            entry_fills: touched_items,
            leg_fills: filled_legs,
        })
    }

    async fn apply_fill_to_item(&self, order: &Order, delta_qty: crate::types::Qty, price: crate::types::Px) -> ControllerResult<()> {
        if order.role != crate::domain::OrderRole::Entry {
            return Ok(());
        }
        let mut item = self.store.get_item(order.item_id).await?;
        item.apply_fill(delta_qty, price);

        let next_status = if item.filled_qty >= item.qty {
            ItemStatus::EntryFilled
        } else {
            ItemStatus::EntryPartial
        };
        if item.status != next_status {
            self.lifecycle.validate_transition(item.status, next_status)?;
            item.status = next_status;
        }

        if self.store.update_item(&item).await? == UpdateOutcome::Stale {
            warn!(item_id = %item.id, "lost race applying fill to item");
        }
        self.audit
            .log_event(
                EventLevel::Info,
                "watcher",
                Some(item.id),
                Some(item.batch_id),
                "fill applied",
                serde_json::json!({"delta_qty": delta_qty.as_f64(), "price": price.as_f64()}),
            )
            .await?;
        Ok(())
    }

    /// Drives an item from `EODMarketSent` to `CLOSED` once its flattening
    /// market order reports `FILLED`. The EOD Closer only submits the order;
    /// this is the only place that observes it land.
    async fn close_item_on_eod_fill(&self, order: &Order) -> ControllerResult<()> {
        let mut item = self.store.get_item(order.item_id).await?;
        if item.status != ItemStatus::EodMarketSent {
            return Ok(());
        }
        self.lifecycle.validate_transition(item.status, ItemStatus::Closed)?;
        item.status = ItemStatus::Closed;
        if self.store.update_item(&item).await? == UpdateOutcome::Stale {
            warn!(item_id = %item.id, "lost race closing item on eod fill");
            return Ok(());
        }
        self.audit
            .log_event(
                EventLevel::Info,
                "watcher",
                Some(item.id),
                Some(item.batch_id),
                "item closed on eod market fill",
                serde_json::Value::Null,
            )
            .await?;
        Ok(())
    }

    pub async fn poll_positions(&self) -> ControllerResult<()> {
        self.rate_limiter.acquire(TrafficClass::Info).await;
        let positions = self.broker.list_positions().await?;
        for p in positions {
            self.store.snapshot_position(&p.handle, p.symbol, p.qty).await?;
        }
        Ok(())
    }

    pub async fn run(
        &self,
        on_entry_fills: mpsc::UnboundedSender<Uuid>,
        on_leg_fills: mpsc::UnboundedSender<Uuid>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut orders_interval = tokio::time::interval(self.orders_period);
        let mut positions_interval = tokio::time::interval(self.positions_period);
        loop {
            tokio::select! {
                _ = orders_interval.tick() => {
                    match self.poll_orders().await {
                        Ok(outcome) => {
                            for id in outcome.entry_fills { let _ = on_entry_fills.send(id); }
                            for id in outcome.leg_fills { let _ = on_leg_fills.send(id); }
                        }
                        Err(e) => warn!(error = %e, "order poll failed"),
                    }
                }
                _ = positions_interval.tick() => {
                    if let Err(e) = self.poll_positions().await {
                        warn!(error = %e, "position poll failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("watcher shutting down");
                    break;
                }
            }
        }
    }
}
