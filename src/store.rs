//! Durable persistence for batches, items, orders, fills and OCO groups.
//!
//! Adapted from this codebase's `persistence.rs` upsert style, moved from
//! Postgres to SQLite (see DESIGN.md for the engine rationale) and changed
//! from last-writer-wins updates to optimistic-version-guarded updates:
//! every mutating statement includes `AND version = ?` and reports how many
//! rows it touched so callers can detect a lost race and re-read.

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::*;
use crate::error::{ControllerError, ControllerResult};
use crate::types::{MarketCode, Px, Qty, Symbol};

pub struct Store {
    pool: SqlitePool,
}

/// Returned by conditional updates so callers can distinguish "nothing
/// matched because of a stale version" (an expected race) from a hard error.
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Stale,
}

impl Store {
    pub async fn connect(database_url: &str) -> ControllerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> ControllerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batch_jobs (
                id TEXT PRIMARY KEY,
                batch_code TEXT NOT NULL UNIQUE,
                scheduled_at TEXT,
                eod_close_hour INTEGER NOT NULL,
                eod_close_minute INTEGER NOT NULL,
                eod_force_close INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                last_error TEXT,
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_batch_jobs_status_sched ON batch_jobs(status, scheduled_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batch_items (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL REFERENCES batch_jobs(id),
                symbol INTEGER NOT NULL,
                market INTEGER NOT NULL,
                product TEXT NOT NULL,
                side TEXT NOT NULL,
                qty INTEGER NOT NULL,
                entry_type TEXT NOT NULL,
                entry_price INTEGER,
                tp_price INTEGER NOT NULL,
                sl_trigger_price INTEGER NOT NULL,
                status TEXT NOT NULL,
                filled_qty INTEGER NOT NULL DEFAULT 0,
                avg_fill_price INTEGER NOT NULL DEFAULT 0,
                entry_order_id TEXT,
                last_error TEXT,
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_batch_items_batch ON batch_items(batch_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL REFERENCES batch_items(id),
                role TEXT NOT NULL,
                broker_order_id TEXT UNIQUE,
                side TEXT NOT NULL,
                qty INTEGER NOT NULL,
                order_type TEXT NOT NULL,
                price INTEGER,
                stop_trigger INTEGER,
                status TEXT NOT NULL,
                cum_qty INTEGER NOT NULL DEFAULT 0,
                avg_price INTEGER NOT NULL DEFAULT 0,
                submitted_at TEXT NOT NULL,
                last_polled_at TEXT,
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_item ON orders(item_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id),
                qty INTEGER NOT NULL,
                price INTEGER NOT NULL,
                filled_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(order_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS oco_groups (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL REFERENCES batch_items(id),
                qty INTEGER NOT NULL,
                tp_order_id TEXT NOT NULL,
                sl_order_id TEXT NOT NULL,
                status TEXT NOT NULL,
                position_handles TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_oco_groups_item_status ON oco_groups(item_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_snapshots (
                id TEXT PRIMARY KEY,
                handle TEXT NOT NULL,
                symbol INTEGER NOT NULL,
                qty INTEGER NOT NULL,
                taken_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduler_runs (
                id TEXT PRIMARY KEY,
                run_at TEXT NOT NULL,
                triggered_count INTEGER NOT NULL,
                outcome TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -- batch jobs ---------------------------------------------------

    pub async fn insert_batch_job(&self, job: &BatchJob) -> ControllerResult<()> {
        sqlx::query(
            r#"INSERT INTO batch_jobs
                (id, batch_code, scheduled_at, eod_close_hour, eod_close_minute,
                 eod_force_close, status, started_at, finished_at, last_error, version)
               VALUES (?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(job.id.to_string())
        .bind(&job.batch_code)
        .bind(job.scheduled_at.map(|t| t.to_rfc3339()))
        .bind(job.eod_close_hour)
        .bind(job.eod_close_minute)
        .bind(job.eod_force_close)
        .bind(status_code(job.status))
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.finished_at.map(|t| t.to_rfc3339()))
        .bind(&job.last_error)
        .bind(job.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Conditional swap used by the Scheduler: only succeeds while the row
    /// is still `SCHEDULED` at the expected version.
    pub async fn try_start_batch(
        &self,
        id: Uuid,
        expected_version: i64,
        now: chrono::DateTime<Utc>,
    ) -> ControllerResult<UpdateOutcome> {
        let result = sqlx::query(
            r#"UPDATE batch_jobs SET status = 'RUNNING', started_at = ?, version = version + 1
               WHERE id = ? AND status = 'SCHEDULED' AND version = ?"#,
        )
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 1 {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Stale
        })
    }

    pub async fn mark_batch_missed(&self, id: Uuid, reason: &str) -> ControllerResult<()> {
        sqlx::query(
            "UPDATE batch_jobs SET status = 'ERROR', last_error = ?, version = version + 1 WHERE id = ?",
        )
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn due_batches(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> ControllerResult<Vec<BatchJob>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_jobs WHERE status = 'SCHEDULED' AND scheduled_at <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_batch_job).collect()
    }

    pub async fn running_batches(&self) -> ControllerResult<Vec<BatchJob>> {
        let rows = sqlx::query("SELECT * FROM batch_jobs WHERE status IN ('RUNNING','PAUSED')")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_batch_job).collect()
    }

    pub async fn get_batch_job(&self, id: Uuid) -> ControllerResult<BatchJob> {
        let row = sqlx::query("SELECT * FROM batch_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ControllerError::InternalInvariant {
                detail: format!("batch {id} not found"),
            })?;
        row_to_batch_job(&row)
    }

    /// Version-guarded update for operator-driven status changes
    /// (pause/resume/cancel) rather than the Scheduler's narrower
    /// `try_start_batch` swap.
    pub async fn update_batch_job(&self, job: &BatchJob) -> ControllerResult<UpdateOutcome> {
        let result = sqlx::query(
            r#"UPDATE batch_jobs SET status = ?, started_at = ?, finished_at = ?,
                last_error = ?, version = version + 1
               WHERE id = ? AND version = ?"#,
        )
        .bind(status_code(job.status))
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.finished_at.map(|t| t.to_rfc3339()))
        .bind(&job.last_error)
        .bind(job.id.to_string())
        .bind(job.version)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 1 {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Stale
        })
    }

    // -- batch items ----------------------------------------------------

    pub async fn insert_batch_item(&self, item: &BatchItem) -> ControllerResult<()> {
        sqlx::query(
            r#"INSERT INTO batch_items
                (id, batch_id, symbol, market, product, side, qty, entry_type, entry_price,
                 tp_price, sl_trigger_price, status, filled_qty, avg_fill_price,
                 entry_order_id, last_error, version)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(item.id.to_string())
        .bind(item.batch_id.to_string())
        .bind(item.symbol.0)
        .bind(item.market.0)
        .bind(product_code(item.product))
        .bind(side_code(item.side))
        .bind(item.qty.raw())
        .bind(entry_type_code(item.entry_type))
        .bind(item.entry_price.map(|p| p.ticks()))
        .bind(item.tp_price.ticks())
        .bind(item.sl_trigger_price.ticks())
        .bind(item_status_code(item.status))
        .bind(item.filled_qty.raw())
        .bind(item.avg_fill_price.ticks())
        .bind(item.entry_order_id.map(|id| id.to_string()))
        .bind(&item.last_error)
        .bind(item.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn items_for_batch(&self, batch_id: Uuid) -> ControllerResult<Vec<BatchItem>> {
        let rows = sqlx::query("SELECT * FROM batch_items WHERE batch_id = ? ORDER BY rowid")
            .bind(batch_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_batch_item).collect()
    }

    pub async fn get_item(&self, id: Uuid) -> ControllerResult<BatchItem> {
        let row = sqlx::query("SELECT * FROM batch_items WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ControllerError::OrderNotFound {
                order_id: id.to_string(),
            })?;
        row_to_batch_item(&row)
    }

    /// Optimistic update: succeeds only if `version` still matches.
    pub async fn update_item(&self, item: &BatchItem) -> ControllerResult<UpdateOutcome> {
        let result = sqlx::query(
            r#"UPDATE batch_items SET status=?, filled_qty=?, avg_fill_price=?,
                entry_order_id=?, last_error=?, version=version+1
               WHERE id=? AND version=?"#,
        )
        .bind(item_status_code(item.status))
        .bind(item.filled_qty.raw())
        .bind(item.avg_fill_price.ticks())
        .bind(item.entry_order_id.map(|id| id.to_string()))
        .bind(&item.last_error)
        .bind(item.id.to_string())
        .bind(item.version)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 1 {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Stale
        })
    }

    // -- orders -----------------------------------------------------------

    pub async fn insert_order(&self, order: &Order) -> ControllerResult<()> {
        sqlx::query(
            r#"INSERT INTO orders
                (id, item_id, role, broker_order_id, side, qty, order_type, price,
                 stop_trigger, status, cum_qty, avg_price, submitted_at, last_polled_at, version)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(order.id.to_string())
        .bind(order.item_id.to_string())
        .bind(role_code(order.role))
        .bind(&order.broker_order_id)
        .bind(side_code(order.side))
        .bind(order.qty.raw())
        .bind(order_type_code(order.order_type))
        .bind(order.price.map(|p| p.ticks()))
        .bind(order.stop_trigger.map(|p| p.ticks()))
        .bind(order_status_code(order.status))
        .bind(order.cum_qty.raw())
        .bind(order.avg_price.ticks())
        .bind(order.submitted_at.to_rfc3339())
        .bind(order.last_polled_at.map(|t| t.to_rfc3339()))
        .bind(order.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn orders_for_item(&self, item_id: Uuid) -> ControllerResult<Vec<Order>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE item_id = ?")
            .bind(item_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_order).collect()
    }

    pub async fn get_order(&self, id: Uuid) -> ControllerResult<Order> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ControllerError::OrderNotFound {
                order_id: id.to_string(),
            })?;
        row_to_order(&row)
    }

    pub async fn open_orders(&self) -> ControllerResult<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE status NOT IN ('FILLED','CANCELLED','EXPIRED','REJECTED')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    pub async fn find_order_by_broker_id(&self, broker_order_id: &str) -> ControllerResult<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE broker_order_id = ?")
            .bind(broker_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    pub async fn update_order(&self, order: &Order) -> ControllerResult<UpdateOutcome> {
        let result = sqlx::query(
            r#"UPDATE orders SET status=?, cum_qty=?, avg_price=?, broker_order_id=?,
                last_polled_at=?, version=version+1
               WHERE id=? AND version=?"#,
        )
        .bind(order_status_code(order.status))
        .bind(order.cum_qty.raw())
        .bind(order.avg_price.ticks())
        .bind(&order.broker_order_id)
        .bind(order.last_polled_at.map(|t| t.to_rfc3339()))
        .bind(order.id.to_string())
        .bind(order.version)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 1 {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Stale
        })
    }

    pub async fn insert_fill(&self, fill: &Fill) -> ControllerResult<()> {
        sqlx::query("INSERT INTO fills (id, order_id, qty, price, filled_at) VALUES (?,?,?,?,?)")
            .bind(fill.id.to_string())
            .bind(fill.order_id.to_string())
            .bind(fill.qty.raw())
            .bind(fill.price.ticks())
            .bind(fill.filled_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn fills_for_order(&self, order_id: Uuid) -> ControllerResult<Vec<Fill>> {
        let rows = sqlx::query("SELECT * FROM fills WHERE order_id = ? ORDER BY filled_at")
            .bind(order_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_fill).collect()
    }

    // -- oco groups ---------------------------------------------------

    pub async fn insert_oco_group(&self, group: &OcoGroup) -> ControllerResult<()> {
        sqlx::query(
            r#"INSERT INTO oco_groups (id, item_id, qty, tp_order_id, sl_order_id, status, position_handles, version)
               VALUES (?,?,?,?,?,?,?,?)"#,
        )
        .bind(group.id.to_string())
        .bind(group.item_id.to_string())
        .bind(group.qty.raw())
        .bind(group.tp_order_id.to_string())
        .bind(group.sl_order_id.to_string())
        .bind(oco_status_code(group.status))
        .bind(serde_json::to_string(&group.position_handles).unwrap_or_else(|_| "[]".into()))
        .bind(group.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_groups_for_item(&self, item_id: Uuid) -> ControllerResult<Vec<OcoGroup>> {
        let rows = sqlx::query("SELECT * FROM oco_groups WHERE item_id = ? AND status = 'ACTIVE'")
            .bind(item_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_oco_group).collect()
    }

    pub async fn groups_for_item(&self, item_id: Uuid) -> ControllerResult<Vec<OcoGroup>> {
        let rows = sqlx::query("SELECT * FROM oco_groups WHERE item_id = ?")
            .bind(item_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_oco_group).collect()
    }

    pub async fn update_oco_group(&self, group: &OcoGroup) -> ControllerResult<UpdateOutcome> {
        let result = sqlx::query(
            "UPDATE oco_groups SET status=?, version=version+1 WHERE id=? AND version=?",
        )
        .bind(oco_status_code(group.status))
        .bind(group.id.to_string())
        .bind(group.version)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 1 {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Stale
        })
    }

    pub async fn record_scheduler_run(&self, triggered_count: i64, outcome: &str) -> ControllerResult<()> {
        sqlx::query("INSERT INTO scheduler_runs (id, run_at, triggered_count, outcome) VALUES (?,?,?,?)")
            .bind(Uuid::new_v4().to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(triggered_count)
            .bind(outcome)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn snapshot_position(&self, handle: &str, symbol: Symbol, qty: Qty) -> ControllerResult<()> {
        sqlx::query(
            "INSERT INTO position_snapshots (id, handle, symbol, qty, taken_at) VALUES (?,?,?,?,?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(handle)
        .bind(symbol.0)
        .bind(qty.raw())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// -- row <-> domain mapping -----------------------------------------------

fn status_code(s: BatchStatus) -> &'static str {
    match s {
        BatchStatus::Scheduled => "SCHEDULED",
        BatchStatus::Running => "RUNNING",
        BatchStatus::Paused => "PAUSED",
        BatchStatus::Done => "DONE",
        BatchStatus::Error => "ERROR",
        BatchStatus::Cancelled => "CANCELLED",
    }
}

fn parse_status(s: &str) -> ControllerResult<BatchStatus> {
    Ok(match s {
        "SCHEDULED" => BatchStatus::Scheduled,
        "RUNNING" => BatchStatus::Running,
        "PAUSED" => BatchStatus::Paused,
        "DONE" => BatchStatus::Done,
        "ERROR" => BatchStatus::Error,
        "CANCELLED" => BatchStatus::Cancelled,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown batch status code {other}"),
            })
        }
    })
}

fn item_status_code(s: ItemStatus) -> &'static str {
    match s {
        ItemStatus::Ready => "READY",
        ItemStatus::EntrySent => "ENTRY_SENT",
        ItemStatus::EntryPartial => "ENTRY_PARTIAL",
        ItemStatus::EntryFilled => "ENTRY_FILLED",
        ItemStatus::BracketSent => "BRACKET_SENT",
        ItemStatus::TpFilled => "TP_FILLED",
        ItemStatus::SlFilled => "SL_FILLED",
        ItemStatus::EodMarketSent => "EOD_MARKET_SENT",
        ItemStatus::Closed => "CLOSED",
        ItemStatus::Error => "ERROR",
    }
}

fn parse_item_status(s: &str) -> ControllerResult<ItemStatus> {
    Ok(match s {
        "READY" => ItemStatus::Ready,
        "ENTRY_SENT" => ItemStatus::EntrySent,
        "ENTRY_PARTIAL" => ItemStatus::EntryPartial,
        "ENTRY_FILLED" => ItemStatus::EntryFilled,
        "BRACKET_SENT" => ItemStatus::BracketSent,
        "TP_FILLED" => ItemStatus::TpFilled,
        "SL_FILLED" => ItemStatus::SlFilled,
        "EOD_MARKET_SENT" => ItemStatus::EodMarketSent,
        "CLOSED" => ItemStatus::Closed,
        "ERROR" => ItemStatus::Error,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown item status code {other}"),
            })
        }
    })
}

fn side_code(s: Side) -> &'static str {
    match s {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn parse_side(s: &str) -> ControllerResult<Side> {
    Ok(match s {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown side code {other}"),
            })
        }
    })
}

fn product_code(p: Product) -> &'static str {
    match p {
        Product::Cash => "CASH",
        Product::Margin => "MARGIN",
    }
}

fn parse_product(s: &str) -> ControllerResult<Product> {
    Ok(match s {
        "CASH" => Product::Cash,
        "MARGIN" => Product::Margin,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown product code {other}"),
            })
        }
    })
}

fn entry_type_code(e: EntryType) -> &'static str {
    match e {
        EntryType::Market => "MARKET",
        EntryType::Limit => "LIMIT",
    }
}

fn parse_entry_type(s: &str) -> ControllerResult<EntryType> {
    Ok(match s {
        "MARKET" => EntryType::Market,
        "LIMIT" => EntryType::Limit,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown entry type code {other}"),
            })
        }
    })
}

fn role_code(r: OrderRole) -> &'static str {
    match r {
        OrderRole::Entry => "ENTRY",
        OrderRole::Tp => "TP",
        OrderRole::Sl => "SL",
        OrderRole::Eod => "EOD",
    }
}

fn parse_role(s: &str) -> ControllerResult<OrderRole> {
    Ok(match s {
        "ENTRY" => OrderRole::Entry,
        "TP" => OrderRole::Tp,
        "SL" => OrderRole::Sl,
        "EOD" => OrderRole::Eod,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown order role code {other}"),
            })
        }
    })
}

fn order_type_code(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::Stop => "STOP",
    }
}

fn parse_order_type(s: &str) -> ControllerResult<OrderType> {
    Ok(match s {
        "MARKET" => OrderType::Market,
        "LIMIT" => OrderType::Limit,
        "STOP" => OrderType::Stop,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown order type code {other}"),
            })
        }
    })
}

fn order_status_code(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::New => "NEW",
        OrderStatus::Working => "WORKING",
        OrderStatus::Partial => "PARTIAL",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Cancelled => "CANCELLED",
        OrderStatus::Expired => "EXPIRED",
        OrderStatus::Rejected => "REJECTED",
    }
}

fn parse_order_status(s: &str) -> ControllerResult<OrderStatus> {
    Ok(match s {
        "NEW" => OrderStatus::New,
        "WORKING" => OrderStatus::Working,
        "PARTIAL" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" => OrderStatus::Cancelled,
        "EXPIRED" => OrderStatus::Expired,
        "REJECTED" => OrderStatus::Rejected,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown order status code {other}"),
            })
        }
    })
}

fn oco_status_code(s: OcoGroupStatus) -> &'static str {
    match s {
        OcoGroupStatus::Active => "ACTIVE",
        OcoGroupStatus::TpFilled => "TP_FILLED",
        OcoGroupStatus::SlFilled => "SL_FILLED",
        OcoGroupStatus::Closed => "CLOSED",
    }
}

fn parse_oco_status(s: &str) -> ControllerResult<OcoGroupStatus> {
    Ok(match s {
        "ACTIVE" => OcoGroupStatus::Active,
        "TP_FILLED" => OcoGroupStatus::TpFilled,
        "SL_FILLED" => OcoGroupStatus::SlFilled,
        "CLOSED" => OcoGroupStatus::Closed,
        other => {
            return Err(ControllerError::InternalInvariant {
                detail: format!("unknown oco group status code {other}"),
            })
        }
    })
}

fn parse_uuid(s: &str) -> ControllerResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| ControllerError::InternalInvariant {
        detail: format!("bad uuid {s}: {e}"),
    })
}

fn parse_rfc3339(s: &str) -> ControllerResult<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ControllerError::InternalInvariant {
            detail: format!("bad timestamp {s}: {e}"),
        })
}

fn row_to_batch_job(row: &sqlx::sqlite::SqliteRow) -> ControllerResult<BatchJob> {
    let scheduled_at: Option<String> = row.try_get("scheduled_at")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    Ok(BatchJob {
        id: parse_uuid(row.try_get::<String, _>("id")?.as_str())?,
        batch_code: row.try_get("batch_code")?,
        scheduled_at: scheduled_at.map(|s| parse_rfc3339(&s)).transpose()?,
        eod_close_hour: row.try_get::<i64, _>("eod_close_hour")? as u32,
        eod_close_minute: row.try_get::<i64, _>("eod_close_minute")? as u32,
        eod_force_close: row.try_get("eod_force_close")?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        started_at: started_at.map(|s| parse_rfc3339(&s)).transpose()?,
        finished_at: finished_at.map(|s| parse_rfc3339(&s)).transpose()?,
        last_error: row.try_get("last_error")?,
        version: row.try_get("version")?,
    })
}

fn row_to_batch_item(row: &sqlx::sqlite::SqliteRow) -> ControllerResult<BatchItem> {
    let entry_order_id: Option<String> = row.try_get("entry_order_id")?;
    let entry_price: Option<i64> = row.try_get("entry_price")?;
    Ok(BatchItem {
        id: parse_uuid(row.try_get::<String, _>("id")?.as_str())?,
        batch_id: parse_uuid(row.try_get::<String, _>("batch_id")?.as_str())?,
        symbol: Symbol(row.try_get::<i64, _>("symbol")? as u32),
        market: MarketCode(row.try_get::<i64, _>("market")? as u8),
        product: parse_product(&row.try_get::<String, _>("product")?)?,
        side: parse_side(&row.try_get::<String, _>("side")?)?,
        qty: Qty::from_raw(row.try_get::<i64, _>("qty")?),
        entry_type: parse_entry_type(&row.try_get::<String, _>("entry_type")?)?,
        entry_price: entry_price.map(Px::from_ticks),
        tp_price: Px::from_ticks(row.try_get("tp_price")?),
        sl_trigger_price: Px::from_ticks(row.try_get("sl_trigger_price")?),
        status: parse_item_status(&row.try_get::<String, _>("status")?)?,
        filled_qty: Qty::from_raw(row.try_get::<i64, _>("filled_qty")?),
        avg_fill_price: Px::from_ticks(row.try_get("avg_fill_price")?),
        entry_order_id: entry_order_id.map(|s| parse_uuid(&s)).transpose()?,
        last_error: row.try_get("last_error")?,
        version: row.try_get("version")?,
    })
}

fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> ControllerResult<Order> {
    let price: Option<i64> = row.try_get("price")?;
    let stop_trigger: Option<i64> = row.try_get("stop_trigger")?;
    let last_polled_at: Option<String> = row.try_get("last_polled_at")?;
    Ok(Order {
        id: parse_uuid(row.try_get::<String, _>("id")?.as_str())?,
        item_id: parse_uuid(row.try_get::<String, _>("item_id")?.as_str())?,
        role: parse_role(&row.try_get::<String, _>("role")?)?,
        broker_order_id: row.try_get("broker_order_id")?,
        side: parse_side(&row.try_get::<String, _>("side")?)?,
        qty: Qty::from_raw(row.try_get::<i64, _>("qty")?),
        order_type: parse_order_type(&row.try_get::<String, _>("order_type")?)?,
        price: price.map(Px::from_ticks),
        stop_trigger: stop_trigger.map(Px::from_ticks),
        status: parse_order_status(&row.try_get::<String, _>("status")?)?,
        cum_qty: Qty::from_raw(row.try_get::<i64, _>("cum_qty")?),
        avg_price: Px::from_ticks(row.try_get("avg_price")?),
        submitted_at: parse_rfc3339(&row.try_get::<String, _>("submitted_at")?)?,
        last_polled_at: last_polled_at.map(|s| parse_rfc3339(&s)).transpose()?,
        version: row.try_get("version")?,
    })
}

fn row_to_fill(row: &sqlx::sqlite::SqliteRow) -> ControllerResult<Fill> {
    Ok(Fill {
        id: parse_uuid(row.try_get::<String, _>("id")?.as_str())?,
        order_id: parse_uuid(row.try_get::<String, _>("order_id")?.as_str())?,
        qty: Qty::from_raw(row.try_get::<i64, _>("qty")?),
        price: Px::from_ticks(row.try_get("price")?),
        filled_at: parse_rfc3339(&row.try_get::<String, _>("filled_at")?)?,
    })
}

fn row_to_oco_group(row: &sqlx::sqlite::SqliteRow) -> ControllerResult<OcoGroup> {
    let handles_json: String = row.try_get("position_handles")?;
    Ok(OcoGroup {
        id: parse_uuid(row.try_get::<String, _>("id")?.as_str())?,
        item_id: parse_uuid(row.try_get::<String, _>("item_id")?.as_str())?,
        qty: Qty::from_raw(row.try_get::<i64, _>("qty")?),
        tp_order_id: parse_uuid(row.try_get::<String, _>("tp_order_id")?.as_str())?,
        sl_order_id: parse_uuid(row.try_get::<String, _>("sl_order_id")?.as_str())?,
        status: parse_oco_status(&row.try_get::<String, _>("status")?)?,
        position_handles: serde_json::from_str(&handles_json).unwrap_or_default(),
        version: row.try_get("version")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_batch() -> BatchJob {
        BatchJob {
            id: Uuid::new_v4(),
            batch_code: format!("B-{}", Uuid::new_v4()),
            scheduled_at: Some(Utc::now()),
            eod_close_hour: 14,
            eod_close_minute: 30,
            eod_force_close: true,
            status: BatchStatus::Scheduled,
            started_at: None,
            finished_at: None,
            last_error: None,
            version: 0,
        }
    }

    #[tokio::test]
    async fn insert_and_start_batch_is_idempotent_under_stale_version() {
        let store = test_store().await;
        let job = sample_batch();
        store.insert_batch_job(&job).await.unwrap();

        let first = store.try_start_batch(job.id, 0, Utc::now()).await.unwrap();
        assert_eq!(first, UpdateOutcome::Applied);

        // Second attempt at the stale version must not re-fire.
        let second = store.try_start_batch(job.id, 0, Utc::now()).await.unwrap();
        assert_eq!(second, UpdateOutcome::Stale);
    }

    #[tokio::test]
    async fn due_batches_only_returns_scheduled_rows_past_their_time() {
        let store = test_store().await;
        let mut due = sample_batch();
        due.scheduled_at = Some(Utc::now() - chrono::Duration::seconds(5));
        let mut future = sample_batch();
        future.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.insert_batch_job(&due).await.unwrap();
        store.insert_batch_job(&future).await.unwrap();

        let found = store.due_batches(Utc::now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn order_broker_id_is_unique() {
        let store = test_store().await;
        let job = sample_batch();
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
            status: ItemStatus::Ready,
            filled_qty: Qty::ZERO,
            avg_fill_price: Px::ZERO,
            entry_order_id: None,
            last_error: None,
            version: 0,
        };
        store.insert_batch_item(&item).await.unwrap();

        let order = Order {
            id: Uuid::new_v4(),
            item_id: item.id,
            role: OrderRole::Entry,
            broker_order_id: Some("BRK-1".into()),
            side: Side::Buy,
            qty: item.qty,
            order_type: OrderType::Market,
            price: None,
            stop_trigger: None,
            status: OrderStatus::New,
            cum_qty: Qty::ZERO,
            avg_price: Px::ZERO,
            submitted_at: Utc::now(),
            last_polled_at: None,
            version: 0,
        };
        store.insert_order(&order).await.unwrap();

        let mut dup = order.clone();
        dup.id = Uuid::new_v4();
        assert!(store.insert_order(&dup).await.is_err());
    }
}
