//! Append-only event and audit trails (§3 `EventLog`/`AuditLog`).
//!
//! `EventLog` records what the system observed and did (order sent, fill
//! applied, bracket rolled back, ...) for operational diagnosis. `AuditLog`
//! records only operator-initiated manual commands, per §6's control
//! surface, each with an actor and a reason. Adapted from this codebase's
//! `audit.rs` append-and-query style.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ControllerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    pub id: Uuid,
    pub level: EventLevel,
    pub component: String,
    pub item_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub message: String,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub actor: String,
    pub command: String,
    pub batch_id: Option<Uuid>,
    pub item_id: Option<Uuid>,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct AuditTrail {
    pool: SqlitePool,
}

impl AuditTrail {
    pub async fn new(pool: SqlitePool) -> ControllerResult<Self> {
        let trail = Self { pool };
        trail.create_tables().await?;
        Ok(trail)
    }

    async fn create_tables(&self) -> ControllerResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS event_logs (
                id TEXT PRIMARY KEY, level TEXT NOT NULL, component TEXT NOT NULL,
                item_id TEXT, batch_id TEXT, message TEXT NOT NULL,
                detail TEXT NOT NULL, at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_logs_item ON event_logs(item_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS audit_logs (
                id TEXT PRIMARY KEY, actor TEXT NOT NULL, command TEXT NOT NULL,
                batch_id TEXT, item_id TEXT, reason TEXT, at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_event(
        &self,
        level: EventLevel,
        component: &str,
        item_id: Option<Uuid>,
        batch_id: Option<Uuid>,
        message: &str,
        detail: serde_json::Value,
    ) -> ControllerResult<()> {
        match level {
            EventLevel::Info => info!(component, message, "controller event"),
            EventLevel::Warn => warn!(component, message, "controller event"),
            EventLevel::Error => error!(component, message, "controller event"),
        }
        sqlx::query(
            "INSERT INTO event_logs (id, level, component, item_id, batch_id, message, detail, at) VALUES (?,?,?,?,?,?,?,?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(level_code(level))
        .bind(component)
        .bind(item_id.map(|i| i.to_string()))
        .bind(batch_id.map(|b| b.to_string()))
        .bind(message)
        .bind(detail.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records an operator-initiated command (§6 control surface). Every
    /// manual command that reaches the Supervisor goes through this, never
    /// the scheduled/automatic path.
    pub async fn log_manual_command(
        &self,
        actor: &str,
        command: &str,
        batch_id: Option<Uuid>,
        item_id: Option<Uuid>,
        reason: Option<&str>,
    ) -> ControllerResult<()> {
        info!(actor, command, "manual command");
        sqlx::query(
            "INSERT INTO audit_logs (id, actor, command, batch_id, item_id, reason, at) VALUES (?,?,?,?,?,?,?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(actor)
        .bind(command)
        .bind(batch_id.map(|b| b.to_string()))
        .bind(item_id.map(|i| i.to_string()))
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn events_for_item(&self, item_id: Uuid) -> ControllerResult<Vec<EventLog>> {
        let rows = sqlx::query("SELECT * FROM event_logs WHERE item_id = ? ORDER BY at")
            .bind(item_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(EventLog {
                id: Uuid::parse_str(&row.try_get::<String, _>("id")?).unwrap_or_default(),
                level: parse_level(&row.try_get::<String, _>("level")?),
                component: row.try_get("component")?,
                item_id: row
                    .try_get::<Option<String>, _>("item_id")?
                    .and_then(|s| Uuid::parse_str(&s).ok()),
                batch_id: row
                    .try_get::<Option<String>, _>("batch_id")?
                    .and_then(|s| Uuid::parse_str(&s).ok()),
                message: row.try_get("message")?,
                detail: serde_json::from_str(&row.try_get::<String, _>("detail")?)
                    .unwrap_or(serde_json::Value::Null),
                at: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("at")?)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(out)
    }
}

fn level_code(level: EventLevel) -> &'static str {
    match level {
        EventLevel::Info => "INFO",
        EventLevel::Warn => "WARN",
        EventLevel::Error => "ERROR",
    }
}

fn parse_level(s: &str) -> EventLevel {
    match s {
        "WARN" => EventLevel::Warn,
        "ERROR" => EventLevel::Error,
        _ => EventLevel::Info,
    }
}
