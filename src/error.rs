//! Error types for the intraday controller.

use thiserror::Error;

/// Error kinds surfaced by the controller's components. Most are recoverable
/// at the item/batch level (see `oco::OcoManager` and `engine::ExecutionEngine`
/// for how each is handled); `InternalInvariant` is fatal for the component
/// that raised it.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("validation failed: {message}")]
    ValidationError { message: String },

    #[error("broker rejected order: {reason}")]
    BrokerRejected { reason: String },

    #[error("broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },

    #[error("broker session expired")]
    AuthExpired,

    #[error("rate limited by broker, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("position handle not available for item {item_id}")]
    PositionNotAvailable { item_id: String },

    #[error("bracket rollback failed for item {item_id}: {detail}")]
    BracketRollbackFailed { item_id: String, detail: String },

    #[error("overfill detected on item {item_id}: both legs of an OCO group reported fills")]
    OverfillDetected { item_id: String },

    #[error("end-of-day close failed for item {item_id}: {reason}")]
    EodFailed { item_id: String, reason: String },

    #[error("internal invariant violated: {detail}")]
    InternalInvariant { detail: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("broker transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControllerError {
    /// Whether the containing command should be retried under the retry
    /// budget described in the configuration's `retry.max_attempts`.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::BrokerUnavailable { .. } | ControllerError::RateLimited { .. }
        )
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
