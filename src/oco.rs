//! OCO Manager: emits take-profit/stop-loss bracket pairs in reaction to
//! entry fills, and cancels the surviving leg once one of them completes
//! (§4.5). Per-item work is serialized by an in-memory mutex keyed on item
//! id (§5) so two fill notifications for the same item never race each
//! other's bracket submission.

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditTrail, EventLevel};
use crate::broker::{BrokerAdapter, OrderPayload};
use crate::config::{Config, OcoMode};
use crate::domain::{
    BatchItem, ItemLifecycle, ItemStatus, Order, OrderRole, OrderStatus, OrderType, Product,
    OcoGroup, OcoGroupStatus,
};
use crate::error::{ControllerError, ControllerResult};
use crate::ratelimit::{RateLimiter, TrafficClass};
use crate::store::{Store, UpdateOutcome};
use crate::types::{Px, Qty};

pub struct OcoManager {
    store: Arc<Store>,
    broker: Arc<dyn BrokerAdapter>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditTrail>,
    lifecycle: ItemLifecycle,
    mode: OcoMode,
    handle_wait: Duration,
    item_locks: SyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl OcoManager {
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
            mode: config.oco_mode,
            handle_wait: Duration::from_secs(10),
            item_locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, item_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.item_locks
            .lock()
            .entry(item_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Entry point called by the Watcher whenever an item's `filled_qty`
    /// increased. Covers exactly the slice(s) not yet owned by a group.
    pub async fn on_fill(&self, item_id: Uuid) -> ControllerResult<()> {
        let lock = self.lock_for(item_id);
        let _guard = lock.lock().await;

        let item = self.store.get_item(item_id).await?;
        match self.mode {
            OcoMode::PerPartial => self.cover_uncovered_slices(&item).await,
            OcoMode::PostComplete => {
                if item.status == ItemStatus::EntryFilled {
                    self.emit_group_if_absent(&item, item.filled_qty).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn cover_uncovered_slices(&self, item: &BatchItem) -> ControllerResult<()> {
        let groups = self.store.groups_for_item(item.id).await?;
        let covered: Qty = groups
            .iter()
            .fold(Qty::ZERO, |acc, g| acc.add(g.qty));
        let uncovered = item.filled_qty.sub(covered);
        if uncovered.is_zero() || uncovered.raw() < 0 {
            return Ok(());
        }
        self.emit_group_if_absent(item, uncovered).await
    }

    /// Splits `slice_qty` across position handles for margin items (one
    /// TP/SL pair, hence one group, per handle) so a group's close orders
    /// never outrun what that handle can actually deliver. Cash items and
    /// margin items backed by a single handle emit exactly one group.
    async fn emit_group_if_absent(&self, item: &BatchItem, slice_qty: Qty) -> ControllerResult<()> {
        if slice_qty.is_zero() {
            return Ok(());
        }

        if item.product != Product::Margin {
            return self.emit_one_group(item, slice_qty, Vec::new()).await;
        }

        let handles = self.await_position_handles(item).await?;
        let mut remaining = slice_qty;
        for (i, position) in handles.iter().enumerate() {
            if remaining.is_zero() || remaining.raw() < 0 {
                break;
            }
            let last = i + 1 == handles.len();
            let chunk = if last { remaining } else { remaining.min(position.qty) };
            if chunk.is_zero() {
                continue;
            }
            self.emit_one_group(item, chunk, vec![position.handle.clone()]).await?;
            remaining = remaining.sub(chunk);
        }
        Ok(())
    }

    async fn emit_one_group(
        &self,
        item: &BatchItem,
        slice_qty: Qty,
        position_handles: Vec<String>,
    ) -> ControllerResult<()> {
        let close_side = item.side.inverted();

        let tp_payload = OrderPayload {
            client_ref: format!("{}-tp-{}", item.id, Uuid::new_v4()),
            symbol: item.symbol,
            market: item.market,
            side: close_side,
            qty: slice_qty,
            order_type: OrderType::Limit,
            price: Some(item.tp_price),
            stop_trigger: None,
        };
        let sl_payload = OrderPayload {
            client_ref: format!("{}-sl-{}", item.id, Uuid::new_v4()),
            symbol: item.symbol,
            market: item.market,
            side: close_side,
            qty: slice_qty,
            order_type: OrderType::Stop,
            price: None,
            stop_trigger: Some(item.sl_trigger_price),
        };

        self.rate_limiter.acquire(TrafficClass::Order).await;
        let tp_broker_id = match self.broker.send_order(tp_payload).await {
            Ok(id) => id,
            Err(e) => {
                self.mark_item_error(item, &format!("TP leg rejected: {e}")).await?;
                return Ok(());
            }
        };

        self.rate_limiter.acquire(TrafficClass::Order).await;
        let sl_broker_id = match self.broker.send_order(sl_payload).await {
            Ok(id) => id,
            Err(e) => {
                // Second leg failed: roll back the first.
                if let Err(cancel_err) = self.broker.cancel_order(&tp_broker_id).await {
                    self.audit
                        .log_event(
                            EventLevel::Error,
                            "oco",
                            Some(item.id),
                            Some(item.batch_id),
                            "bracket rollback failed",
                            serde_json::json!({"tp_broker_id": tp_broker_id, "cancel_error": cancel_err.to_string()}),
                        )
                        .await?;
                    return Err(ControllerError::BracketRollbackFailed {
                        item_id: item.id.to_string(),
                        detail: cancel_err.to_string(),
                    });
                }
                self.mark_item_error(item, &format!("BRACKET_SECOND_LEG_REJECTED: {e}")).await?;
                return Ok(());
            }
        };

        let tp_order = Order {
            id: Uuid::new_v4(),
            item_id: item.id,
            role: OrderRole::Tp,
            broker_order_id: Some(tp_broker_id),
            side: close_side,
            qty: slice_qty,
            order_type: OrderType::Limit,
            price: Some(item.tp_price),
            stop_trigger: None,
            status: OrderStatus::Working,
            cum_qty: Qty::ZERO,
            avg_price: Px::ZERO,
            submitted_at: Utc::now(),
            last_polled_at: None,
            version: 0,
        };
        let sl_order = Order {
            id: Uuid::new_v4(),
            item_id: item.id,
            role: OrderRole::Sl,
            broker_order_id: Some(sl_broker_id),
            side: close_side,
            qty: slice_qty,
            order_type: OrderType::Stop,
            price: None,
            stop_trigger: Some(item.sl_trigger_price),
            status: OrderStatus::Working,
            cum_qty: Qty::ZERO,
            avg_price: Px::ZERO,
            submitted_at: Utc::now(),
            last_polled_at: None,
            version: 0,
        };
        self.store.insert_order(&tp_order).await?;
        self.store.insert_order(&sl_order).await?;

        let group = OcoGroup {
            id: Uuid::new_v4(),
            item_id: item.id,
            qty: slice_qty,
            tp_order_id: tp_order.id,
            sl_order_id: sl_order.id,
            status: OcoGroupStatus::Active,
            position_handles,
            version: 0,
        };
        self.store.insert_oco_group(&group).await?;

        let mut updated = item.clone();
        if updated.status != ItemStatus::BracketSent {
            self.lifecycle.validate_transition(updated.status, ItemStatus::BracketSent)?;
            updated.status = ItemStatus::BracketSent;
            self.store.update_item(&updated).await?;
        }

        self.audit
            .log_event(
                EventLevel::Info,
                "oco",
                Some(item.id),
                Some(item.batch_id),
                "bracket emitted",
                serde_json::json!({"qty": slice_qty.as_f64(), "group_id": group.id}),
            )
            .await?;
        info!(item_id = %item.id, group_id = %group.id, "bracket emitted");
        Ok(())
    }

    async fn await_position_handles(&self, item: &BatchItem) -> ControllerResult<Vec<crate::broker::Position>> {
        let deadline = tokio::time::Instant::now() + self.handle_wait;
        loop {
            let positions = self.broker.list_positions().await?;
            let handles: Vec<crate::broker::Position> = positions
                .into_iter()
                .filter(|p| p.symbol == item.symbol)
                .collect();
            if !handles.is_empty() {
                return Ok(handles);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ControllerError::PositionNotAvailable {
                    item_id: item.id.to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn mark_item_error(&self, item: &BatchItem, reason: &str) -> ControllerResult<()> {
        let mut updated = item.clone();
        updated.status = ItemStatus::Error;
        updated.last_error = Some(reason.to_string());
        self.store.update_item(&updated).await?;
        self.audit
            .log_event(
                EventLevel::Error,
                "oco",
                Some(item.id),
                Some(item.batch_id),
                reason,
                serde_json::Value::Null,
            )
            .await?;
        Ok(())
    }

    /// Called by the Watcher when a TP or SL order reaches `Filled`.
    /// Cancels the sibling, then closes the group once the sibling is
    /// terminal. Detects the "both filled" race as `OverfillDetected`.
    pub async fn on_leg_filled(&self, filled_order_id: Uuid) -> ControllerResult<()> {
        let order = self.store.get_order(filled_order_id).await?;

        let lock = self.lock_for(order.item_id);
        let _guard = lock.lock().await;

        let groups = self.store.groups_for_item(order.item_id).await?;
        let Some(mut group) = groups.into_iter().find(|g| {
            (g.tp_order_id == order.id || g.sl_order_id == order.id)
                && g.status == OcoGroupStatus::Active
        }) else {
            return Ok(());
        };

        let (sibling_id, new_group_status) = if order.id == group.tp_order_id {
            (group.sl_order_id, OcoGroupStatus::TpFilled)
        } else {
            (group.tp_order_id, OcoGroupStatus::SlFilled)
        };

        group.status = new_group_status;
        if self.store.update_oco_group(&group).await? == UpdateOutcome::Stale {
            warn!(group_id = %group.id, new_status = ?new_group_status, "lost race updating oco group status");
            return Ok(());
        }
        group.version += 1;

        let sibling_orders = self.store.orders_for_item(order.item_id).await?;
        let sibling = sibling_orders
            .into_iter()
            .find(|o| o.id == sibling_id)
            .ok_or_else(|| ControllerError::OrderNotFound {
                order_id: sibling_id.to_string(),
            })?;

        if sibling.status == OrderStatus::Filled {
            // Both legs report filled: overfill race.
            let mut item = self.store.get_item(order.item_id).await?;
            item.status = ItemStatus::Error;
            item.last_error = Some("overfill: both OCO legs filled".to_string());
            self.store.update_item(&item).await?;
            self.audit
                .log_event(
                    EventLevel::Error,
                    "oco",
                    Some(order.item_id),
                    None,
                    "overfill detected",
                    serde_json::json!({"group_id": group.id}),
                )
                .await?;
            return Err(ControllerError::OverfillDetected {
                item_id: order.item_id.to_string(),
            });
        }

        if !sibling.status.is_terminal() {
            if let Some(broker_id) = &sibling.broker_order_id {
                match self.broker.cancel_order(broker_id).await {
                    Ok(()) => {
                        let mut cancelled = sibling.clone();
                        cancelled.status = OrderStatus::Cancelled;
                        self.store.update_order(&cancelled).await?;
                    }
                    Err(ControllerError::OrderNotFound { .. }) => {
                        // Already gone broker-side; the next poll reconciles its true state.
                    }
                    Err(e) => warn!(order_id = %sibling.id, error = %e, "sibling cancel failed"),
                }
            }
        }

        let mut group = group;
        group.status = OcoGroupStatus::Closed;
        if self.store.update_oco_group(&group).await? == UpdateOutcome::Stale {
            warn!(group_id = %group.id, "lost race closing oco group");
            return Ok(());
        }

        let groups = self.store.groups_for_item(order.item_id).await?;
        let closed_qty: Qty = groups
            .iter()
            .filter(|g| g.status == OcoGroupStatus::Closed)
            .fold(Qty::ZERO, |acc, g| acc.add(g.qty));

        let mut item = self.store.get_item(order.item_id).await?;
        if closed_qty >= item.qty {
            let target = if new_group_status == OcoGroupStatus::TpFilled {
                ItemStatus::TpFilled
            } else {
                ItemStatus::SlFilled
            };
            if item.status != target {
                self.lifecycle.validate_transition(item.status, target).ok();
                item.status = target;
                self.store.update_item(&item).await?;
            }
            let mut closed = item.clone();
            closed.status = ItemStatus::Closed;
            self.store.update_item(&closed).await?;
        }

        Ok(())
    }
}
