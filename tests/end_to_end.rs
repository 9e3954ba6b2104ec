//! Integration tests wiring Engine, Watcher and OcoManager together through
//! a scripted broker stub, exercising the full entry-fill -> bracket ->
//! leg-fill -> close path end to end rather than one component at a time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use intraday_ctl::audit::AuditTrail;
use intraday_ctl::broker::{BrokerAdapter, BrokerOrderStatus, OrderPayload, Position, Quote};
use intraday_ctl::config::Config;
use intraday_ctl::domain::*;
use intraday_ctl::engine::ExecutionEngine;
use intraday_ctl::error::ControllerResult;
use intraday_ctl::oco::OcoManager;
use intraday_ctl::ratelimit::RateLimiter;
use intraday_ctl::store::Store;
use intraday_ctl::types::{MarketCode, Px, Qty, Symbol};
use intraday_ctl::watcher::Watcher;

/// In-memory broker double. Unlike the crate's own `MockBrokerAdapter`
/// (`cfg(test)`-only, invisible outside the library's own unit tests), this
/// one is a plain hand-rolled `BrokerAdapter` so it links into an external
/// integration test binary.
struct StubBroker {
    orders: Mutex<HashMap<String, BrokerOrderStatus>>,
    positions: Mutex<Vec<Position>>,
    next_id: Mutex<u64>,
}

impl StubBroker {
    fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    fn set_status(&self, broker_order_id: &str, status: OrderStatus, cum_qty: Qty, avg_price: Px) {
        let mut orders = self.orders.lock().unwrap();
        let entry = orders.get_mut(broker_order_id).expect("unknown order id");
        entry.status = status;
        entry.cum_qty = cum_qty;
        entry.avg_price = avg_price;
    }

    fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock().unwrap() = positions;
    }
}

#[async_trait]
impl BrokerAdapter for StubBroker {
    async fn authenticate(&self) -> ControllerResult<()> {
        Ok(())
    }

    async fn send_order(&self, _payload: OrderPayload) -> ControllerResult<String> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = format!("BRK-{next_id}");
        self.orders.lock().unwrap().insert(
            id.clone(),
            BrokerOrderStatus {
                broker_order_id: id.clone(),
                status: OrderStatus::Working,
                cum_qty: Qty::ZERO,
                avg_price: Px::ZERO,
            },
        );
        Ok(id)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> ControllerResult<()> {
        if let Some(o) = self.orders.lock().unwrap().get_mut(broker_order_id) {
            o.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn list_orders(&self) -> ControllerResult<Vec<BrokerOrderStatus>> {
        Ok(self.orders.lock().unwrap().values().cloned().collect())
    }

    async fn list_positions(&self) -> ControllerResult<Vec<Position>> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn get_board(&self, symbol: Symbol) -> ControllerResult<Quote> {
        Ok(Quote {
            symbol,
            bid: Px::ZERO,
            ask: Px::ZERO,
        })
    }
}

struct Harness {
    store: Arc<Store>,
    broker: Arc<StubBroker>,
    engine: ExecutionEngine,
    watcher: Watcher,
    oco: OcoManager,
}

impl Harness {
    async fn new(config: &Config) -> Self {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let broker = Arc::new(StubBroker::new());
        let rate_limiter = Arc::new(RateLimiter::new(1000, 1000));
        let audit_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let audit = Arc::new(AuditTrail::new(audit_pool).await.unwrap());

        let engine = ExecutionEngine::new(
            store.clone(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            rate_limiter.clone(),
            audit.clone(),
        );
        let watcher = Watcher::new(
            store.clone(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            rate_limiter.clone(),
            audit.clone(),
            config,
        );
        let oco = OcoManager::new(
            store.clone(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            rate_limiter,
            audit,
            config,
        );

        Self {
            store,
            broker,
            engine,
            watcher,
            oco,
        }
    }

    async fn insert_batch(&self) -> BatchJob {
        let job = BatchJob {
            id: Uuid::new_v4(),
            batch_code: "B1".into(),
            scheduled_at: None,
            eod_close_hour: 14,
            eod_close_minute: 30,
            eod_force_close: true,
            status: BatchStatus::Running,
            started_at: Some(chrono::Utc::now()),
            finished_at: None,
            last_error: None,
            version: 0,
        };
        self.store.insert_batch_job(&job).await.unwrap();
        job
    }

    async fn entry_broker_id(&self, item: &BatchItem) -> String {
        self.store
            .orders_for_item(item.id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.role == OrderRole::Entry)
            .unwrap()
            .broker_order_id
            .unwrap()
    }
}

fn cash_item(batch_id: Uuid, side: Side, symbol: u32, qty: i64, tp: f64, sl: f64) -> BatchItem {
    BatchItem {
        id: Uuid::new_v4(),
        batch_id,
        symbol: Symbol(symbol),
        market: MarketCode(1),
        product: Product::Cash,
        side,
        qty: Qty::from_units(qty),
        entry_type: EntryType::Market,
        entry_price: None,
        tp_price: Px::new(tp),
        sl_trigger_price: Px::new(sl),
        status: ItemStatus::Ready,
        filled_qty: Qty::ZERO,
        avg_fill_price: Px::ZERO,
        entry_order_id: None,
        last_error: None,
        version: 0,
    }
}

#[tokio::test]
async fn happy_cash_take_profit_closes_item_and_cancels_stop() {
    let config = Config::default();
    let h = Harness::new(&config).await;
    let job = h.insert_batch().await;
    let item = cash_item(job.id, Side::Buy, 9432, 100, 1000.0, 900.0);
    h.store.insert_batch_item(&item).await.unwrap();

    h.engine.run(job.id).await.unwrap();
    let entry_id = h.entry_broker_id(&item).await;

    h.broker
        .set_status(&entry_id, OrderStatus::Filled, Qty::from_units(100), Px::new(950.0));
    let outcome = h.watcher.poll_orders().await.unwrap();
    assert_eq!(outcome.entry_fills, vec![item.id]);
    assert_eq!(h.store.get_item(item.id).await.unwrap().status, ItemStatus::EntryFilled);

    h.oco.on_fill(item.id).await.unwrap();
    let orders = h.store.orders_for_item(item.id).await.unwrap();
    let tp = orders.iter().find(|o| o.role == OrderRole::Tp).unwrap().clone();
    let sl = orders.iter().find(|o| o.role == OrderRole::Sl).unwrap().clone();
    assert_eq!(h.store.get_item(item.id).await.unwrap().status, ItemStatus::BracketSent);

    let tp_broker_id = tp.broker_order_id.clone().unwrap();
    h.broker
        .set_status(&tp_broker_id, OrderStatus::Filled, Qty::from_units(100), Px::new(1000.0));
    let outcome = h.watcher.poll_orders().await.unwrap();
    assert_eq!(outcome.leg_fills, vec![tp.id]);

    h.oco.on_leg_filled(tp.id).await.unwrap();

    let closed = h.store.get_item(item.id).await.unwrap();
    assert_eq!(closed.status, ItemStatus::Closed);
    let sl_after = h
        .store
        .orders_for_item(item.id)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.id == sl.id)
        .unwrap();
    assert_eq!(sl_after.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn happy_margin_stop_loss_closes_item_and_cancels_take_profit() {
    let config = Config::default();
    let h = Harness::new(&config).await;
    let job = h.insert_batch().await;
    let mut item = cash_item(job.id, Side::Sell, 9433, 200, 1800.0, 2050.0);
    item.product = Product::Margin;
    h.store.insert_batch_item(&item).await.unwrap();

    h.engine.run(job.id).await.unwrap();
    let entry_id = h.entry_broker_id(&item).await;
    h.broker
        .set_status(&entry_id, OrderStatus::Filled, Qty::from_units(200), Px::new(2000.0));
    h.watcher.poll_orders().await.unwrap();
    assert_eq!(h.store.get_item(item.id).await.unwrap().status, ItemStatus::EntryFilled);

    h.broker.set_positions(vec![Position {
        handle: "E2026ABC".into(),
        symbol: Symbol(9433),
        qty: Qty::from_units(200),
    }]);
    h.oco.on_fill(item.id).await.unwrap();

    let orders = h.store.orders_for_item(item.id).await.unwrap();
    let tp = orders.iter().find(|o| o.role == OrderRole::Tp).unwrap().clone();
    let sl = orders.iter().find(|o| o.role == OrderRole::Sl).unwrap().clone();
    let groups = h.store.groups_for_item(item.id).await.unwrap();
    assert_eq!(groups[0].position_handles, vec!["E2026ABC".to_string()]);

    let sl_broker_id = sl.broker_order_id.clone().unwrap();
    h.broker
        .set_status(&sl_broker_id, OrderStatus::Filled, Qty::from_units(200), Px::new(2055.0));
    let outcome = h.watcher.poll_orders().await.unwrap();
    assert_eq!(outcome.leg_fills, vec![sl.id]);

    h.oco.on_leg_filled(sl.id).await.unwrap();

    let closed = h.store.get_item(item.id).await.unwrap();
    assert_eq!(closed.status, ItemStatus::Closed);
    let tp_after = h
        .store
        .orders_for_item(item.id)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.id == tp.id)
        .unwrap();
    assert_eq!(tp_after.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn restart_mid_execution_does_not_resubmit_already_sent_entry() {
    let config = Config::default();
    let h = Harness::new(&config).await;
    let job = h.insert_batch().await;
    let mut item = cash_item(job.id, Side::Buy, 9435, 50, 600.0, 550.0);

    // Simulate a process restart after the entry order row was persisted and
    // the item flipped to `EntrySent`, i.e. the window the scenario targets.
    let order = Order {
        id: Uuid::new_v4(),
        item_id: item.id,
        role: OrderRole::Entry,
        broker_order_id: Some("BRK-PRE-RESTART".into()),
        side: item.side,
        qty: item.qty,
        order_type: OrderType::Market,
        price: None,
        stop_trigger: None,
        status: OrderStatus::Working,
        cum_qty: Qty::ZERO,
        avg_price: Px::ZERO,
        submitted_at: chrono::Utc::now(),
        last_polled_at: None,
        version: 0,
    };
    item.status = ItemStatus::EntrySent;
    item.entry_order_id = Some(order.id);
    h.store.insert_batch_item(&item).await.unwrap();
    h.store.insert_order(&order).await.unwrap();
    h.broker.orders.lock().unwrap().insert(
        "BRK-PRE-RESTART".into(),
        BrokerOrderStatus {
            broker_order_id: "BRK-PRE-RESTART".into(),
            status: OrderStatus::Working,
            cum_qty: Qty::ZERO,
            avg_price: Px::ZERO,
        },
    );

    // The Engine's restart-time pass must see a non-`Ready` item and skip it.
    h.engine.run(job.id).await.unwrap();
    let orders_after = h.store.orders_for_item(item.id).await.unwrap();
    assert_eq!(orders_after.len(), 1, "engine resubmitted a duplicate entry order");

    // The Watcher still reconciles normally against the surviving order.
    let outcome = h.watcher.poll_orders().await.unwrap();
    assert!(outcome.entry_fills.is_empty());
    assert_eq!(h.store.get_item(item.id).await.unwrap().status, ItemStatus::EntrySent);
}
