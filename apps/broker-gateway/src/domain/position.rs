//! Positions
//!
//! A position is replaced wholesale by every reconciliation snapshot and
//! nudged by individual fills in between. The record keeps both halves so
//! `quantity == snapshot_quantity + applied_fill_quantity` always holds.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::identifiers::{AccountId, InstrumentKey};

/// One line of a broker position snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPosition {
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Signed quantity (negative is short).
    pub quantity: Decimal,
    /// Average cost per unit.
    pub avg_cost: Decimal,
}

/// Authoritative positions for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Account.
    pub account_id: AccountId,
    /// All non-flat positions the broker reports.
    pub positions: Vec<SnapshotPosition>,
    /// Snapshot time.
    pub as_of: DateTime<Utc>,
}

/// Cached position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Account.
    pub account_id: AccountId,
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Signed quantity.
    pub quantity: Decimal,
    /// Average cost per unit.
    pub avg_cost: Decimal,
    /// Quantity reported by the last snapshot.
    pub snapshot_quantity: Decimal,
    /// Net signed fill quantity applied since that snapshot.
    pub applied_fill_quantity: Decimal,
    /// Time of the last snapshot or fill.
    pub as_of: DateTime<Utc>,
}

impl PositionRecord {
    /// Seed a record from a snapshot line.
    #[must_use]
    pub fn from_snapshot(
        account_id: AccountId,
        line: &SnapshotPosition,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id,
            instrument: line.instrument.clone(),
            quantity: line.quantity,
            avg_cost: line.avg_cost,
            snapshot_quantity: line.quantity,
            applied_fill_quantity: Decimal::ZERO,
            as_of,
        }
    }

    /// Start a flat record for an instrument first seen through a fill.
    #[must_use]
    pub fn flat(account_id: AccountId, instrument: InstrumentKey, as_of: DateTime<Utc>) -> Self {
        Self {
            account_id,
            instrument,
            quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            snapshot_quantity: Decimal::ZERO,
            applied_fill_quantity: Decimal::ZERO,
            as_of,
        }
    }

    /// Apply a signed fill.
    ///
    /// Average cost is volume-weighted when the position grows, unchanged
    /// when it shrinks, and reset to the fill price when it flips side.
    pub fn apply_fill(&mut self, signed_quantity: Decimal, price: Decimal, at: DateTime<Utc>) {
        if signed_quantity.is_zero() {
            return;
        }

        let old = self.quantity;
        let new = old + signed_quantity;

        self.avg_cost = if old.is_zero() {
            price
        } else if old.is_sign_positive() == signed_quantity.is_sign_positive() {
            let old_abs = old.abs();
            let fill_abs = signed_quantity.abs();
            (old_abs * self.avg_cost + fill_abs * price) / (old_abs + fill_abs)
        } else if new.is_zero() {
            Decimal::ZERO
        } else if new.is_sign_positive() == old.is_sign_positive() {
            self.avg_cost
        } else {
            price
        };

        self.quantity = new;
        self.applied_fill_quantity += signed_quantity;
        if at > self.as_of {
            self.as_of = at;
        }
    }

    /// Check the snapshot-plus-fills invariant.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.quantity == self.snapshot_quantity + self.applied_fill_quantity
    }

    /// Check if the position is flat.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// A quantity change observed while replacing positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionChange {
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Cached quantity before the snapshot.
    pub previous: Decimal,
    /// Snapshot quantity.
    pub current: Decimal,
}

/// Result of applying a position snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDiff {
    /// Instruments the cache did not have.
    pub added: Vec<InstrumentKey>,
    /// Instruments whose quantity or cost changed.
    pub updated: Vec<PositionChange>,
    /// Instruments the snapshot no longer lists.
    pub removed: Vec<InstrumentKey>,
    /// Instruments that matched exactly.
    pub unchanged: Vec<InstrumentKey>,
}

impl PositionDiff {
    /// Check if the snapshot changed anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn position(quantity: Decimal, avg_cost: Decimal) -> PositionRecord {
        PositionRecord::from_snapshot(
            AccountId::from("DU1"),
            &SnapshotPosition {
                instrument: InstrumentKey::from("MSFT"),
                quantity,
                avg_cost,
            },
            Utc::now(),
        )
    }

    #[test]
    fn increase_weights_cost() {
        let mut p = position(dec!(10), dec!(100));
        p.apply_fill(dec!(10), dec!(110), Utc::now());
        assert_eq!(p.quantity, dec!(20));
        assert_eq!(p.avg_cost, dec!(105));
    }

    #[test]
    fn reduce_keeps_cost() {
        let mut p = position(dec!(10), dec!(100));
        p.apply_fill(dec!(-4), dec!(120), Utc::now());
        assert_eq!(p.quantity, dec!(6));
        assert_eq!(p.avg_cost, dec!(100));
    }

    #[test]
    fn flip_resets_cost() {
        let mut p = position(dec!(5), dec!(100));
        p.apply_fill(dec!(-8), dec!(90), Utc::now());
        assert_eq!(p.quantity, dec!(-3));
        assert_eq!(p.avg_cost, dec!(90));
    }

    #[test]
    fn close_out_zeroes_cost() {
        let mut p = position(dec!(5), dec!(100));
        p.apply_fill(dec!(-5), dec!(90), Utc::now());
        assert!(p.is_flat());
        assert_eq!(p.avg_cost, dec!(0));
    }

    #[test]
    fn diff_reports_changes() {
        let mut diff = PositionDiff::default();
        assert!(!diff.has_changes());
        diff.unchanged.push(InstrumentKey::from("SPY"));
        assert!(!diff.has_changes());
        diff.removed.push(InstrumentKey::from("QQQ"));
        assert!(diff.has_changes());
    }

    proptest! {
        #[test]
        fn fills_keep_quantity_consistent(
            start in -1000i64..1000,
            fills in prop::collection::vec((-50i64..50, 1i64..500), 0..40),
        ) {
            let mut p = position(Decimal::from(start), dec!(10));
            for (qty, price) in fills {
                p.apply_fill(Decimal::from(qty), Decimal::from(price), Utc::now());
                prop_assert!(p.is_consistent());
            }
        }
    }
}
