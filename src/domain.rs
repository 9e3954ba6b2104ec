//! Core entities: batches, items, orders, fills and OCO groups, plus the
//! item state machine. Tagged sum types stand in for the teacher's string
//! status columns so an invalid transition fails at the compile boundary
//! wherever the call site matches on a concrete variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{ControllerError, ControllerResult};
use crate::types::{MarketCode, Px, Qty, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub const fn inverted(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Product {
    Cash,
    Margin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    Tp,
    Sl,
    Eod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Working,
    Partial,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Scheduled,
    Running,
    Paused,
    Done,
    Error,
    Cancelled,
}

/// Item lifecycle, §4.3 of the controller specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    Ready,
    EntrySent,
    EntryPartial,
    EntryFilled,
    BracketSent,
    TpFilled,
    SlFilled,
    EodMarketSent,
    Closed,
    Error,
}

impl ItemStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Closed | ItemStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcoGroupStatus {
    Active,
    TpFilled,
    SlFilled,
    Closed,
}

/// Validates legal `ItemStatus` transitions so the rest of the system never
/// has to re-derive the state diagram from scratch.
pub struct ItemLifecycle {
    valid_transitions: HashMap<ItemStatus, Vec<ItemStatus>>,
}

impl Default for ItemLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemLifecycle {
    pub fn new() -> Self {
        use ItemStatus::*;
        let mut valid_transitions = HashMap::new();
        valid_transitions.insert(Ready, vec![EntrySent, Error]);
        valid_transitions.insert(EntrySent, vec![EntryPartial, EntryFilled, Closed, Error]);
        valid_transitions.insert(
            EntryPartial,
            vec![EntryPartial, EntryFilled, BracketSent, Error],
        );
        valid_transitions.insert(EntryFilled, vec![BracketSent, Error]);
        valid_transitions.insert(
            BracketSent,
            vec![TpFilled, SlFilled, EodMarketSent, Error],
        );
        valid_transitions.insert(TpFilled, vec![Closed, Error]);
        valid_transitions.insert(SlFilled, vec![Closed, Error]);
        valid_transitions.insert(EodMarketSent, vec![Closed, Error]);
        // EOD / panic-stop can force a close from any non-terminal state.
        for state in [Ready, EntrySent, EntryPartial, EntryFilled, BracketSent] {
            valid_transitions
                .entry(state)
                .or_insert_with(Vec::new)
                .push(EodMarketSent);
        }
        valid_transitions.insert(Closed, vec![]);
        valid_transitions.insert(Error, vec![]);
        Self { valid_transitions }
    }

    pub fn validate_transition(&self, from: ItemStatus, to: ItemStatus) -> ControllerResult<()> {
        if from.is_terminal() {
            return Err(ControllerError::InternalInvariant {
                detail: format!("cannot transition item out of terminal state {from:?}"),
            });
        }
        match self.valid_transitions.get(&from) {
            Some(allowed) if allowed.contains(&to) => Ok(()),
            _ => Err(ControllerError::InternalInvariant {
                detail: format!("illegal item transition {from:?} -> {to:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub batch_code: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub eod_close_hour: u32,
    pub eod_close_minute: u32,
    pub eod_force_close: bool,
    pub status: BatchStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub symbol: Symbol,
    pub market: MarketCode,
    pub product: Product,
    pub side: Side,
    pub qty: Qty,
    pub entry_type: EntryType,
    pub entry_price: Option<Px>,
    pub tp_price: Px,
    pub sl_trigger_price: Px,
    pub status: ItemStatus,
    pub filled_qty: Qty,
    pub avg_fill_price: Px,
    pub entry_order_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub version: i64,
}

impl BatchItem {
    /// Weighted-average fill price update after a new fill of `qty`@`price`.
    pub fn apply_fill(&mut self, qty: Qty, price: Px) {
        let prior_notional = self.avg_fill_price.as_f64() * self.filled_qty.as_f64();
        let new_notional = price.as_f64() * qty.as_f64();
        let new_filled = self.filled_qty.add(qty);
        self.avg_fill_price = if new_filled.is_zero() {
            Px::ZERO
        } else {
            Px::new((prior_notional + new_notional) / new_filled.as_f64())
        };
        self.filled_qty = new_filled;
    }

    pub const fn remaining_qty(&self) -> Qty {
        self.qty.sub(self.filled_qty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub item_id: Uuid,
    pub role: OrderRole,
    pub broker_order_id: Option<String>,
    pub side: Side,
    pub qty: Qty,
    pub order_type: OrderType,
    pub price: Option<Px>,
    pub stop_trigger: Option<Px>,
    pub status: OrderStatus,
    pub cum_qty: Qty,
    pub avg_price: Px,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: Uuid,
    pub order_id: Uuid,
    pub qty: Qty,
    pub price: Px,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoGroup {
    pub id: Uuid,
    pub item_id: Uuid,
    pub qty: Qty,
    pub tp_order_id: Uuid,
    pub sl_order_id: Uuid,
    pub status: OcoGroupStatus,
    pub position_handles: Vec<String>,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_can_only_move_to_entry_sent_error_or_eod() {
        let lc = ItemLifecycle::new();
        assert!(lc.validate_transition(ItemStatus::Ready, ItemStatus::EntrySent).is_ok());
        assert!(lc.validate_transition(ItemStatus::Ready, ItemStatus::EodMarketSent).is_ok());
        assert!(lc
            .validate_transition(ItemStatus::Ready, ItemStatus::TpFilled)
            .is_err());
    }

    #[test]
    fn terminal_states_reject_any_transition() {
        let lc = ItemLifecycle::new();
        assert!(lc
            .validate_transition(ItemStatus::Closed, ItemStatus::Ready)
            .is_err());
        assert!(lc
            .validate_transition(ItemStatus::Error, ItemStatus::Closed)
            .is_err());
    }

    #[test]
    fn bracket_sent_can_resolve_either_leg() {
        let lc = ItemLifecycle::new();
        assert!(lc
            .validate_transition(ItemStatus::BracketSent, ItemStatus::TpFilled)
            .is_ok());
        assert!(lc
            .validate_transition(ItemStatus::BracketSent, ItemStatus::SlFilled)
            .is_ok());
    }

    #[test]
    fn side_inversion_is_involution() {
        assert_eq!(Side::Buy.inverted(), Side::Sell);
        assert_eq!(Side::Sell.inverted().inverted(), Side::Sell);
    }

    #[test]
    fn apply_fill_updates_weighted_average() {
        let mut item = BatchItem {
            id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            symbol: Symbol(9432),
            market: MarketCode(1),
            product: Product::Cash,
            side: Side::Buy,
            qty: Qty::from_units(300),
            entry_type: EntryType::Limit,
            entry_price: Some(Px::new(500.0)),
            tp_price: Px::new(520.0),
            sl_trigger_price: Px::new(480.0),
            status: ItemStatus::EntrySent,
            filled_qty: Qty::ZERO,
            avg_fill_price: Px::ZERO,
            entry_order_id: None,
            last_error: None,
            version: 0,
        };
        item.apply_fill(Qty::from_units(100), Px::new(500.0));
        item.apply_fill(Qty::from_units(200), Px::new(501.0));
        assert_eq!(item.filled_qty, Qty::from_units(300));
        assert!((item.avg_fill_price.as_f64() - 500.666_666_7).abs() < 0.001);
    }
}
