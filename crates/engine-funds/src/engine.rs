//! The process-wide balance ledger.
//!
//! Layout is `user_id -> sub_account_id -> coin -> Balance`. The outer map
//! sits behind one read/write lock, each sub-account behind its own.
//! Every operation holds the outer lock (shared) for its whole duration
//! and the account lock(s) it touches (exclusive); only account creation
//! and [`FundsEngine::load`] take the outer lock exclusively.
//!
//! Each operation is expressed as a list of per-coin [`Delta`]s that is
//! staged against the current rows, validated, and only then written, so
//! a rejected operation leaves every row untouched.

use std::collections::{BTreeMap, HashMap, HashSet};

use engine_core::{Market, Order, OrderError, OrderStatus, Trade};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use crate::balance::{AccountKey, Balance, BalanceRow, Delta};
use crate::error::FundsError;

type CoinRows = HashMap<String, Balance>;
type Users = HashMap<u64, HashMap<u64, RwLock<CoinRows>>>;

enum Failure {
    UnknownCoin(String),
    Overflow(String),
    Inconsistent { coin: String, attempted: Balance },
}

impl Failure {
    fn into_error(self, key: AccountKey) -> FundsError {
        match self {
            Failure::UnknownCoin(coin) => FundsError::InvalidCoinSymbol(coin),
            Failure::Overflow(coin) => {
                warn!(user = key.user_id, sub_account = key.sub_account_id, coin = %coin, "balance out of range, nothing written");
                FundsError::OutOfRange { coin }
            }
            Failure::Inconsistent { coin, attempted } => {
                error!(
                    user = key.user_id,
                    sub_account = key.sub_account_id,
                    coin = %coin,
                    ?attempted,
                    "balance invariant violated, nothing written"
                );
                FundsError::InvariantViolation {
                    user_id: key.user_id,
                    sub_account_id: key.sub_account_id,
                    coin,
                    attempted,
                }
            }
        }
    }
}

type Staged = Vec<(String, Balance)>;

fn write(rows: &mut CoinRows, staged: Staged) {
    for (coin, balance) in staged {
        rows.insert(coin, balance);
    }
}

fn ensure_amount(amount: Decimal) -> Result<(), FundsError> {
    if amount < Decimal::ZERO {
        return Err(FundsError::InvalidAmount(amount));
    }
    Ok(())
}

fn sum(amount: Decimal, fee: Decimal) -> Result<Decimal, FundsError> {
    amount.checked_add(fee).ok_or(FundsError::InvalidAmount(amount))
}

fn insufficient(coin: &str, available: Decimal, required: Decimal) -> FundsError {
    warn!(coin = %coin, %available, %required, "insufficient funds");
    FundsError::InsufficientFunds {
        coin: coin.to_owned(),
        available,
        required,
    }
}

/// Where an order's trade proceeds land.
fn credit(order: &Order, amount: Decimal) -> Delta {
    if order.holds_proceeds() {
        Delta::credit_reserved(amount)
    } else {
        Delta::available(amount)
    }
}

/// An order that just filled gives back what it locked but did not use.
fn residual(order: &Order) -> Option<Delta> {
    if order.status != OrderStatus::Filled || !order.holds_funds() {
        return None;
    }
    let unused = order.locked_funds - order.used_funds;
    (unused > Decimal::ZERO).then(|| Delta::reserve(-unused))
}

/// In-memory balances of every user; see the module docs for locking.
pub struct FundsEngine {
    users: RwLock<Users>,
    coins: HashSet<String>,
}

impl FundsEngine {
    /// `coins` are the symbols accounts may hold.
    pub fn new<I, S>(coins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FundsEngine {
            users: RwLock::new(HashMap::new()),
            coins: coins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn knows_coin(&self, coin: &str) -> bool {
        self.coins.contains(coin)
    }

    /// Creates the sub-account if missing; returns whether it was created.
    pub fn ensure_account(&self, user_id: u64, sub_account_id: u64) -> bool {
        if self.has_account(user_id, sub_account_id) {
            return false;
        }
        let mut users = self.users.write();
        let subs = users.entry(user_id).or_default();
        if subs.contains_key(&sub_account_id) {
            return false;
        }
        subs.insert(sub_account_id, RwLock::new(CoinRows::new()));
        debug!(user = user_id, sub_account = sub_account_id, "account created");
        true
    }

    pub fn has_account(&self, user_id: u64, sub_account_id: u64) -> bool {
        self.users
            .read()
            .get(&user_id)
            .map_or(false, |subs| subs.contains_key(&sub_account_id))
    }

    pub fn account_count(&self) -> usize {
        self.users.read().values().map(HashMap::len).sum()
    }

    fn lookup(users: &Users, key: AccountKey) -> Result<&RwLock<CoinRows>, FundsError> {
        let subs = users.get(&key.user_id).ok_or(FundsError::InvalidUserBalance { user_id: key.user_id })?;
        subs.get(&key.sub_account_id)
            .ok_or(FundsError::InvalidUserBalanceAccount {
                user_id: key.user_id,
                sub_account_id: key.sub_account_id,
            })
    }

    fn check_coin(&self, rows: &CoinRows, coin: &str) -> Result<(), FundsError> {
        if self.coins.contains(coin) || rows.contains_key(coin) {
            Ok(())
        } else {
            Err(FundsError::InvalidCoinSymbol(coin.to_owned()))
        }
    }

    fn stage(&self, rows: &CoinRows, deltas: &[(&str, Delta)]) -> Result<Staged, Failure> {
        let mut staged: Staged = Vec::with_capacity(deltas.len());
        for (coin, delta) in deltas {
            if !self.coins.contains(*coin) && !rows.contains_key(*coin) {
                return Err(Failure::UnknownCoin((*coin).to_owned()));
            }
            if delta.is_zero() {
                continue;
            }
            let overflow = || Failure::Overflow((*coin).to_owned());
            match staged.iter_mut().find(|(c, _)| c == coin) {
                Some((_, balance)) => *balance = balance.with(*delta).ok_or_else(overflow)?,
                None => {
                    let current = rows.get(*coin).copied().unwrap_or_default();
                    staged.push(((*coin).to_owned(), current.with(*delta).ok_or_else(overflow)?));
                }
            }
        }
        if let Some((coin, attempted)) = staged.iter().find(|(_, b)| !b.is_consistent()) {
            return Err(Failure::Inconsistent {
                coin: coin.clone(),
                attempted: *attempted,
            });
        }
        Ok(staged)
    }

    /// Runs `op` with the account's rows locked exclusively.
    fn with_account<R>(
        &self,
        key: AccountKey,
        op: impl FnOnce(&mut CoinRows) -> Result<R, FundsError>,
    ) -> Result<R, FundsError> {
        let users = self.users.read();
        let cell = Self::lookup(&users, key)?;
        let mut rows = cell.write();
        op(&mut rows)
    }

    fn apply(&self, key: AccountKey, deltas: &[(&str, Delta)]) -> Result<(), FundsError> {
        self.with_account(key, |rows| {
            let staged = self.stage(rows, deltas).map_err(|f| f.into_error(key))?;
            write(rows, staged);
            Ok(())
        })
    }

    fn row(rows: &CoinRows, coin: &str) -> Balance {
        rows.get(coin).copied().unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Deposits and withdrawals
    // ------------------------------------------------------------------

    /// A deposit was seen but is not confirmed yet: `locked += amount`.
    pub fn new_deposit(&self, user_id: u64, sub_account_id: u64, coin: &str, amount: Decimal) -> Result<(), FundsError> {
        ensure_amount(amount)?;
        self.apply(AccountKey::new(user_id, sub_account_id), &[(coin, Delta::locked(amount))])?;
        debug!(user = user_id, sub_account = sub_account_id, coin = %coin, %amount, "deposit registered");
        Ok(())
    }

    /// `locked -= amount; available += amount`.
    pub fn confirm_deposit(&self, user_id: u64, sub_account_id: u64, coin: &str, amount: Decimal) -> Result<(), FundsError> {
        ensure_amount(amount)?;
        let key = AccountKey::new(user_id, sub_account_id);
        self.with_account(key, |rows| {
            self.check_coin(rows, coin)?;
            let pending = Self::row(rows, coin).pending_withdrawal();
            if pending < amount {
                return Err(insufficient(coin, pending, amount));
            }
            let delta = Delta {
                available: amount,
                locked: -amount,
                in_orders: Decimal::ZERO,
            };
            let staged = self.stage(rows, &[(coin, delta)]).map_err(|f| f.into_error(key))?;
            write(rows, staged);
            Ok(())
        })?;
        debug!(user = user_id, sub_account = sub_account_id, coin = %coin, %amount, "deposit confirmed");
        Ok(())
    }

    /// `available -= amount; locked += amount`.
    pub fn new_manual_withdraw(
        &self,
        user_id: u64,
        sub_account_id: u64,
        coin: &str,
        amount: Decimal,
    ) -> Result<(), FundsError> {
        ensure_amount(amount)?;
        let key = AccountKey::new(user_id, sub_account_id);
        self.with_account(key, |rows| {
            self.check_coin(rows, coin)?;
            let available = Self::row(rows, coin).available;
            if available < amount {
                return Err(insufficient(coin, available, amount));
            }
            let delta = Delta {
                available: -amount,
                locked: amount,
                in_orders: Decimal::ZERO,
            };
            let staged = self.stage(rows, &[(coin, delta)]).map_err(|f| f.into_error(key))?;
            write(rows, staged);
            Ok(())
        })?;
        debug!(user = user_id, sub_account = sub_account_id, coin = %coin, %amount, "manual withdrawal locked");
        Ok(())
    }

    /// Requires `amount + fee` of locked funds not held by orders;
    /// `locked -= amount + fee`.
    pub fn new_withdraw(
        &self,
        user_id: u64,
        sub_account_id: u64,
        coin: &str,
        amount: Decimal,
        fee: Decimal,
    ) -> Result<(), FundsError> {
        ensure_amount(amount)?;
        ensure_amount(fee)?;
        let total = sum(amount, fee)?;
        let key = AccountKey::new(user_id, sub_account_id);
        self.with_account(key, |rows| {
            self.check_coin(rows, coin)?;
            let pending = Self::row(rows, coin).pending_withdrawal();
            if pending < total {
                return Err(insufficient(coin, pending, total));
            }
            let staged = self
                .stage(rows, &[(coin, Delta::locked(-total))])
                .map_err(|f| f.into_error(key))?;
            write(rows, staged);
            Ok(())
        })?;
        debug!(user = user_id, sub_account = sub_account_id, coin = %coin, %amount, %fee, "withdrawal submitted");
        Ok(())
    }

    /// `locked -= amount`.
    pub fn confirm_withdraw(&self, user_id: u64, sub_account_id: u64, coin: &str, amount: Decimal) -> Result<(), FundsError> {
        ensure_amount(amount)?;
        let key = AccountKey::new(user_id, sub_account_id);
        self.with_account(key, |rows| {
            self.check_coin(rows, coin)?;
            let pending = Self::row(rows, coin).pending_withdrawal();
            if pending < amount {
                return Err(insufficient(coin, pending, amount));
            }
            let staged = self
                .stage(rows, &[(coin, Delta::locked(-amount))])
                .map_err(|f| f.into_error(key))?;
            write(rows, staged);
            Ok(())
        })?;
        debug!(user = user_id, sub_account = sub_account_id, coin = %coin, %amount, "withdrawal confirmed");
        Ok(())
    }

    /// `locked += amount + fee`.
    pub fn revert_withdraw(
        &self,
        user_id: u64,
        sub_account_id: u64,
        coin: &str,
        amount: Decimal,
        fee: Decimal,
    ) -> Result<(), FundsError> {
        ensure_amount(amount)?;
        ensure_amount(fee)?;
        let total = sum(amount, fee)?;
        self.apply(AccountKey::new(user_id, sub_account_id), &[(coin, Delta::locked(total))])?;
        debug!(user = user_id, sub_account = sub_account_id, coin = %coin, %amount, %fee, "withdrawal reverted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Runs `check(available)` under the account lock, then moves `amount`
    /// from available into locked and in_orders.
    pub fn lock_new_order<F>(
        &self,
        user_id: u64,
        sub_account_id: u64,
        coin: &str,
        amount: Decimal,
        check: F,
    ) -> Result<(), FundsError>
    where
        F: FnOnce(Decimal) -> Result<(), OrderError>,
    {
        self.lock_new_order_with(user_id, sub_account_id, &[(coin, amount)], |available| {
            check(available.first().copied().unwrap_or_default())
        })
    }

    /// Locks several coins of one account in one critical section.
    /// `check` sees the available amount of each entry of `locks`, in order.
    pub fn lock_new_order_with<F>(
        &self,
        user_id: u64,
        sub_account_id: u64,
        locks: &[(&str, Decimal)],
        check: F,
    ) -> Result<(), FundsError>
    where
        F: FnOnce(&[Decimal]) -> Result<(), OrderError>,
    {
        for (_, amount) in locks {
            ensure_amount(*amount)?;
        }
        let key = AccountKey::new(user_id, sub_account_id);
        self.with_account(key, |rows| {
            let mut available = Vec::with_capacity(locks.len());
            for (coin, _) in locks {
                self.check_coin(rows, coin)?;
                available.push(Self::row(rows, coin).available);
            }
            check(&available)?;

            let mut wanted: BTreeMap<&str, Decimal> = BTreeMap::new();
            for (coin, amount) in locks {
                let entry = wanted.entry(*coin).or_default();
                *entry = sum(*entry, *amount)?;
            }
            for (coin, amount) in &wanted {
                let have = Self::row(rows, coin).available;
                if have < *amount {
                    return Err(insufficient(coin, have, *amount));
                }
            }

            let deltas: Vec<(&str, Delta)> = locks.iter().map(|(coin, amount)| (*coin, Delta::reserve(*amount))).collect();
            let staged = self.stage(rows, &deltas).map_err(|f| f.into_error(key))?;
            write(rows, staged);
            Ok(())
        })?;
        debug!(user = user_id, sub_account = sub_account_id, ?locks, "order funds locked");
        Ok(())
    }

    /// For orders whose lock depends on the balance itself: `size(available)`
    /// returns the amount to lock. Returns what was locked.
    pub fn lock_new_order_sized<F>(
        &self,
        user_id: u64,
        sub_account_id: u64,
        coin: &str,
        size: F,
    ) -> Result<Decimal, FundsError>
    where
        F: FnOnce(Decimal) -> Result<Decimal, OrderError>,
    {
        let key = AccountKey::new(user_id, sub_account_id);
        let locked = self.with_account(key, |rows| {
            self.check_coin(rows, coin)?;
            let available = Self::row(rows, coin).available;
            let amount = size(available)?;
            ensure_amount(amount)?;
            if amount > available {
                return Err(insufficient(coin, available, amount));
            }
            let staged = self
                .stage(rows, &[(coin, Delta::reserve(amount))])
                .map_err(|f| f.into_error(key))?;
            write(rows, staged);
            Ok(amount)
        })?;
        debug!(user = user_id, sub_account = sub_account_id, coin = %coin, amount = %locked, "order funds locked");
        Ok(locked)
    }

    /// Returns an order's unused lock: `available += amount; locked -= amount;
    /// in_orders -= amount`.
    pub fn cancel_order(&self, user_id: u64, sub_account_id: u64, coin: &str, amount: Decimal) -> Result<(), FundsError> {
        ensure_amount(amount)?;
        self.apply(AccountKey::new(user_id, sub_account_id), &[(coin, Delta::reserve(-amount))])?;
        debug!(user = user_id, sub_account = sub_account_id, coin = %coin, %amount, "order funds released");
        Ok(())
    }

    /// Settles one trade across the ask and bid accounts.
    ///
    /// Both order snapshots are post-trade. A side whose order just filled
    /// also gets its unused lock back; a side whose order holds proceeds
    /// has its credit reserved instead of made available. Self-trades
    /// lock the single account once.
    pub fn trade(
        &self,
        trade: &Trade,
        ask_order: &Order,
        bid_order: &Order,
        market: &Market,
        ask_credit: Decimal,
        bid_credit: Decimal,
    ) -> Result<(), FundsError> {
        ensure_amount(ask_credit)?;
        ensure_amount(bid_credit)?;

        let base = market.market_coin.as_str();
        let quote = market.quote_coin.as_str();

        let mut ask_deltas = vec![(base, Delta::spend(trade.volume)), (quote, credit(ask_order, ask_credit))];
        if let Some(d) = residual(ask_order) {
            ask_deltas.push((base, d));
        }
        let mut bid_deltas = vec![(quote, Delta::spend(trade.quote_volume)), (base, credit(bid_order, bid_credit))];
        if let Some(d) = residual(bid_order) {
            bid_deltas.push((quote, d));
        }

        let ask_key = AccountKey::new(trade.ask_owner_id, trade.ask_sub_account_id);
        let bid_key = AccountKey::new(trade.bid_owner_id, trade.bid_sub_account_id);

        let users = self.users.read();
        let ask_cell = Self::lookup(&users, ask_key)?;
        let bid_cell = Self::lookup(&users, bid_key)?;

        if ask_key == bid_key {
            let mut rows = ask_cell.write();
            ask_deltas.extend(bid_deltas);
            let staged = self.stage(&rows, &ask_deltas).map_err(|f| f.into_error(ask_key))?;
            write(&mut rows, staged);
        } else {
            // Lock in key order so concurrent settlements never deadlock.
            let (mut ask_rows, mut bid_rows) = if ask_key < bid_key {
                let a = ask_cell.write();
                let b = bid_cell.write();
                (a, b)
            } else {
                let b = bid_cell.write();
                let a = ask_cell.write();
                (a, b)
            };
            let ask_staged = self.stage(&ask_rows, &ask_deltas).map_err(|f| f.into_error(ask_key))?;
            let bid_staged = self.stage(&bid_rows, &bid_deltas).map_err(|f| f.into_error(bid_key))?;
            write(&mut ask_rows, ask_staged);
            write(&mut bid_rows, bid_staged);
        }

        debug!(
            market = %market.id,
            trade = trade.id,
            volume = %trade.volume,
            quote_volume = %trade.quote_volume,
            "trade settled"
        );
        Ok(())
    }

    /// Credits collected fees to the platform account.
    pub fn credit_revenue(&self, user_id: u64, sub_account_id: u64, coin: &str, amount: Decimal) -> Result<(), FundsError> {
        ensure_amount(amount)?;
        if amount.is_zero() {
            return Ok(());
        }
        self.apply(AccountKey::new(user_id, sub_account_id), &[(coin, Delta::available(amount))])
    }

    // ------------------------------------------------------------------
    // Reads, warm-up and checkpoint
    // ------------------------------------------------------------------

    /// Point-in-time copy of one sub-account.
    pub fn get_balances(&self, user_id: u64, sub_account_id: u64) -> Result<BTreeMap<String, Balance>, FundsError> {
        let users = self.users.read();
        let cell = Self::lookup(&users, AccountKey::new(user_id, sub_account_id))?;
        let rows = cell.read();
        Ok(rows.iter().map(|(coin, b)| (coin.clone(), *b)).collect())
    }

    /// A missing row reads as zero.
    pub fn balance(&self, user_id: u64, sub_account_id: u64, coin: &str) -> Result<Balance, FundsError> {
        let users = self.users.read();
        let cell = Self::lookup(&users, AccountKey::new(user_id, sub_account_id))?;
        let rows = cell.read();
        self.check_coin(&rows, coin)?;
        Ok(Self::row(&rows, coin))
    }

    /// Every row, ordered by account then coin.
    pub fn snapshot(&self) -> Vec<BalanceRow> {
        let users = self.users.read();
        let mut out = Vec::new();
        for (user_id, subs) in users.iter() {
            for (sub_account_id, cell) in subs.iter() {
                for (coin, balance) in cell.read().iter() {
                    out.push(BalanceRow {
                        user_id: *user_id,
                        sub_account_id: *sub_account_id,
                        coin: coin.clone(),
                        balance: *balance,
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            (a.user_id, a.sub_account_id, &a.coin).cmp(&(b.user_id, b.sub_account_id, &b.coin))
        });
        out
    }

    /// `available + locked` of `coin` summed over every account.
    pub fn total(&self, coin: &str) -> Decimal {
        let users = self.users.read();
        users
            .values()
            .flat_map(|subs| subs.values())
            .map(|cell| cell.read().get(coin).map_or(Decimal::ZERO, Balance::total))
            .fold(Decimal::ZERO, Decimal::saturating_add)
    }

    /// Replaces every balance with `rows`. An inconsistent row rejects the
    /// whole load.
    pub fn load(&self, rows: impl IntoIterator<Item = BalanceRow>) -> Result<usize, FundsError> {
        let mut fresh: Users = HashMap::new();
        let mut count = 0;
        for row in rows {
            if !row.balance.is_consistent() {
                return Err(FundsError::InvariantViolation {
                    user_id: row.user_id,
                    sub_account_id: row.sub_account_id,
                    coin: row.coin,
                    attempted: row.balance,
                });
            }
            fresh
                .entry(row.user_id)
                .or_default()
                .entry(row.sub_account_id)
                .or_insert_with(|| RwLock::new(CoinRows::new()))
                .get_mut()
                .insert(row.coin, row.balance);
            count += 1;
        }
        *self.users.write() = fresh;
        debug!(rows = count, "balances loaded");
        Ok(count)
    }
}
