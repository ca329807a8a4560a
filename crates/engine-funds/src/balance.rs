//! Balance rows and the deltas applied to them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// `(user_id, sub_account_id)`; the ordering is the account lock order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub user_id: u64,
    pub sub_account_id: u64,
}

impl AccountKey {
    pub fn new(user_id: u64, sub_account_id: u64) -> Self {
        AccountKey {
            user_id,
            sub_account_id,
        }
    }
}

/// One coin of one sub-account.
///
/// `locked` covers both pending withdrawals and open orders; `in_orders`
/// is the part reserved by open orders.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub available: Decimal,
    pub locked: Decimal,
    pub in_orders: Decimal,
}

impl Balance {
    pub fn new(available: Decimal, locked: Decimal, in_orders: Decimal) -> Self {
        Balance {
            available,
            locked,
            in_orders,
        }
    }

    /// All three amounts non-negative and `in_orders <= locked`.
    pub fn is_consistent(&self) -> bool {
        self.available >= Decimal::ZERO
            && self.locked >= Decimal::ZERO
            && self.in_orders >= Decimal::ZERO
            && self.in_orders <= self.locked
    }

    /// Locked but not reserved by an order.
    pub fn pending_withdrawal(&self) -> Decimal {
        self.locked - self.in_orders
    }

    /// `available + locked`, saturating at `Decimal::MAX`.
    pub fn total(&self) -> Decimal {
        self.available.saturating_add(self.locked)
    }

    /// `None` when any of the three amounts leaves `Decimal`'s range.
    pub(crate) fn with(self, d: Delta) -> Option<Balance> {
        Some(Balance {
            available: self.available.checked_add(d.available)?,
            locked: self.locked.checked_add(d.locked)?,
            in_orders: self.in_orders.checked_add(d.in_orders)?,
        })
    }
}

/// A balance row as persisted by the ledger checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub user_id: u64,
    pub sub_account_id: u64,
    pub coin: String,
    pub balance: Balance,
}

/// Signed change to a balance row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) struct Delta {
    pub available: Decimal,
    pub locked: Decimal,
    pub in_orders: Decimal,
}

impl Delta {
    pub fn available(amount: Decimal) -> Self {
        Delta {
            available: amount,
            ..Delta::default()
        }
    }

    pub fn locked(amount: Decimal) -> Self {
        Delta {
            locked: amount,
            ..Delta::default()
        }
    }

    /// `available -> locked + in_orders`; negative `amount` reverses it.
    pub fn reserve(amount: Decimal) -> Self {
        Delta {
            available: -amount,
            locked: amount,
            in_orders: amount,
        }
    }

    /// An order consumed `amount` of its reservation.
    pub fn spend(amount: Decimal) -> Self {
        Delta {
            available: Decimal::ZERO,
            locked: -amount,
            in_orders: -amount,
        }
    }

    /// Incoming funds parked against an open order.
    pub fn credit_reserved(amount: Decimal) -> Self {
        Delta {
            available: Decimal::ZERO,
            locked: amount,
            in_orders: amount,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.available.is_zero() && self.locked.is_zero() && self.in_orders.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn reserve_then_release_is_neutral() {
        let b = Balance::new(dec!(10), dec!(0), dec!(0));
        let reserved = b.with(Delta::reserve(dec!(4))).unwrap();
        assert_eq!(reserved, Balance::new(dec!(6), dec!(4), dec!(4)));
        assert_eq!(reserved.with(Delta::reserve(dec!(-4))), Some(b));
    }

    #[test]
    fn overflowing_delta_is_refused() {
        let b = Balance::new(Decimal::MAX, Decimal::MAX, dec!(0));
        assert_eq!(b.with(Delta::available(dec!(1))), None);
        assert_eq!(b.total(), Decimal::MAX);
    }

    #[test]
    fn in_orders_may_not_exceed_locked() {
        assert!(Balance::new(dec!(0), dec!(2), dec!(2)).is_consistent());
        assert!(!Balance::new(dec!(0), dec!(1), dec!(2)).is_consistent());
        assert!(!Balance::new(dec!(-1), dec!(0), dec!(0)).is_consistent());
    }

    #[test]
    fn withdrawal_part_of_locked() {
        let b = Balance::new(dec!(0), dec!(5), dec!(3));
        assert_eq!(b.pending_withdrawal(), dec!(2));
        assert_eq!(b.total(), dec!(5));
    }
}
