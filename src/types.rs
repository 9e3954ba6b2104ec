//! Fixed-point price/quantity types and symbol identifiers.
//!
//! Ported from the shared `Px`/`Qty`/`Symbol` value types used across this
//! codebase's trading services; prices and quantities are stored as scaled
//! `i64` ticks so arithmetic never drifts the way floating point does.

use serde::{Deserialize, Serialize};
use std::fmt;

const SCALE: i64 = 10_000;
const MAX_SAFE: f64 = (i64::MAX / SCALE) as f64;
const MIN_SAFE: f64 = (i64::MIN / SCALE) as f64;

/// Exchange/instrument symbol, interned as an opaque numeric code by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub u32);

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SYM_{}", self.0)
    }
}

/// Price expressed in 1/10000ths of a unit (a "tick").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Px(i64);

impl Px {
    pub const ZERO: Px = Px(0);

    pub fn new(value: f64) -> Self {
        let clamped = value.clamp(MIN_SAFE, MAX_SAFE);
        Px((clamped * SCALE as f64).round() as i64)
    }

    pub const fn from_ticks(ticks: i64) -> Self {
        Px(ticks)
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    pub const fn add(self, other: Px) -> Px {
        Px(self.0 + other.0)
    }

    pub const fn sub(self, other: Px) -> Px {
        Px(self.0 - other.0)
    }
}

impl fmt::Display for Px {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / SCALE;
        let frac = (self.0 % SCALE).unsigned_abs();
        write!(f, "{whole}.{frac:04}")
    }
}

/// Quantity expressed in 1/10000ths of a unit, matching `Px`'s scale so
/// notional (`px * qty`) stays in fixed point end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Qty(i64);

impl Qty {
    pub const ZERO: Qty = Qty(0);

    pub fn new(value: f64) -> Self {
        let clamped = value.clamp(MIN_SAFE, MAX_SAFE);
        Qty((clamped * SCALE as f64).round() as i64)
    }

    pub const fn from_units(units: i64) -> Self {
        Qty(units * SCALE)
    }

    pub const fn from_raw(raw: i64) -> Self {
        Qty(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    pub const fn add(self, other: Qty) -> Qty {
        Qty(self.0 + other.0)
    }

    pub const fn sub(self, other: Qty) -> Qty {
        Qty(self.0 - other.0)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Qty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / SCALE;
        let frac = (self.0 % SCALE).unsigned_abs();
        write!(f, "{whole}.{frac:04}")
    }
}

/// Exchange/market code as understood by the broker adapter. Kept opaque to
/// the rest of the system so the 2026-02-28 code-mapping change is isolated
/// inside `broker::map_market_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketCode(pub u8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn px_round_trips_through_display() {
        let p = Px::new(1000.5);
        assert_eq!(p.as_f64(), 1000.5);
        assert_eq!(p.to_string(), "1000.5000");
    }

    #[test]
    fn qty_add_sub() {
        let a = Qty::from_units(100);
        let b = Qty::from_units(30);
        assert_eq!(a.sub(b), Qty::from_units(70));
        assert_eq!(b.add(Qty::from_units(70)), a);
    }

    #[test]
    fn qty_is_zero() {
        assert!(Qty::ZERO.is_zero());
        assert!(!Qty::from_units(1).is_zero());
    }
}
