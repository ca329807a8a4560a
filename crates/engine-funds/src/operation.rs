//! Deposit and withdrawal mutations expressed as data.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::balance::AccountKey;
use crate::engine::FundsEngine;
use crate::error::FundsError;

/// One external balance mutation, as submitted by the deposit and
/// withdrawal collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FundsOperation {
    NewDeposit {
        user_id: u64,
        sub_account_id: u64,
        coin: String,
        amount: Decimal,
    },
    ConfirmDeposit {
        user_id: u64,
        sub_account_id: u64,
        coin: String,
        amount: Decimal,
    },
    NewManualWithdraw {
        user_id: u64,
        sub_account_id: u64,
        coin: String,
        amount: Decimal,
    },
    NewWithdraw {
        user_id: u64,
        sub_account_id: u64,
        coin: String,
        amount: Decimal,
        fee: Decimal,
    },
    ConfirmWithdraw {
        user_id: u64,
        sub_account_id: u64,
        coin: String,
        amount: Decimal,
    },
    RevertWithdraw {
        user_id: u64,
        sub_account_id: u64,
        coin: String,
        amount: Decimal,
        fee: Decimal,
    },
}

impl FundsOperation {
    pub fn account(&self) -> AccountKey {
        let (user_id, sub_account_id) = match self {
            FundsOperation::NewDeposit { user_id, sub_account_id, .. }
            | FundsOperation::ConfirmDeposit { user_id, sub_account_id, .. }
            | FundsOperation::NewManualWithdraw { user_id, sub_account_id, .. }
            | FundsOperation::NewWithdraw { user_id, sub_account_id, .. }
            | FundsOperation::ConfirmWithdraw { user_id, sub_account_id, .. }
            | FundsOperation::RevertWithdraw { user_id, sub_account_id, .. } => (*user_id, *sub_account_id),
        };
        AccountKey::new(user_id, sub_account_id)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FundsOperation::NewDeposit { .. } => "new_deposit",
            FundsOperation::ConfirmDeposit { .. } => "confirm_deposit",
            FundsOperation::NewManualWithdraw { .. } => "new_manual_withdraw",
            FundsOperation::NewWithdraw { .. } => "new_withdraw",
            FundsOperation::ConfirmWithdraw { .. } => "confirm_withdraw",
            FundsOperation::RevertWithdraw { .. } => "revert_withdraw",
        }
    }

    /// A new deposit opens the account if this is its first balance.
    pub fn apply(&self, funds: &FundsEngine) -> Result<(), FundsError> {
        match self {
            FundsOperation::NewDeposit { user_id, sub_account_id, coin, amount } => {
                if !funds.knows_coin(coin) {
                    return Err(FundsError::InvalidCoinSymbol(coin.clone()));
                }
                funds.ensure_account(*user_id, *sub_account_id);
                funds.new_deposit(*user_id, *sub_account_id, coin, *amount)
            }
            FundsOperation::ConfirmDeposit { user_id, sub_account_id, coin, amount } => {
                funds.confirm_deposit(*user_id, *sub_account_id, coin, *amount)
            }
            FundsOperation::NewManualWithdraw { user_id, sub_account_id, coin, amount } => {
                funds.new_manual_withdraw(*user_id, *sub_account_id, coin, *amount)
            }
            FundsOperation::NewWithdraw { user_id, sub_account_id, coin, amount, fee } => {
                funds.new_withdraw(*user_id, *sub_account_id, coin, *amount, *fee)
            }
            FundsOperation::ConfirmWithdraw { user_id, sub_account_id, coin, amount } => {
                funds.confirm_withdraw(*user_id, *sub_account_id, coin, *amount)
            }
            FundsOperation::RevertWithdraw { user_id, sub_account_id, coin, amount, fee } => {
                funds.revert_withdraw(*user_id, *sub_account_id, coin, *amount, *fee)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn new_deposit_opens_the_account() {
        let funds = FundsEngine::new(["btc"]);
        let op = FundsOperation::NewDeposit {
            user_id: 7,
            sub_account_id: 1,
            coin: "btc".into(),
            amount: dec!(3),
        };
        op.apply(&funds).unwrap();
        assert_eq!(funds.balance(7, 1, "btc").unwrap().locked, dec!(3));
        assert_eq!(op.account(), AccountKey::new(7, 1));
    }

    #[test]
    fn unknown_coin_does_not_open_an_account() {
        let funds = FundsEngine::new(["btc"]);
        let op = FundsOperation::NewDeposit {
            user_id: 7,
            sub_account_id: 0,
            coin: "xrp".into(),
            amount: dec!(1),
        };
        assert_eq!(op.apply(&funds), Err(FundsError::InvalidCoinSymbol("xrp".into())));
        assert!(!funds.has_account(7, 0));
    }

    #[test]
    fn other_operations_need_an_existing_account() {
        let funds = FundsEngine::new(["btc"]);
        let op = FundsOperation::ConfirmDeposit {
            user_id: 7,
            sub_account_id: 0,
            coin: "btc".into(),
            amount: dec!(1),
        };
        assert_eq!(op.apply(&funds), Err(FundsError::InvalidUserBalance { user_id: 7 }));
    }
}
