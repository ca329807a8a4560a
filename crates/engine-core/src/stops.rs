//! Parked stop orders waiting for the last trade price to cross their
//! `stop_price`.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;

use crate::order::Order;
use crate::order_type::StopType;

/// Stop-trigger set of one market.
///
/// Keys are `(stop_price, admission)` so that among equal stop prices the
/// earlier order fires first.
#[derive(Debug, Default)]
pub struct StopSet {
    /// Fires when last price <= stop price; the highest stop fires first.
    loss: BTreeMap<(Decimal, u64), Order>,
    /// Fires when last price >= stop price; the lowest stop fires first.
    entry: BTreeMap<(Decimal, u64), Order>,
    index: HashMap<u64, (StopType, Decimal, u64)>,
    admitted: u64,
}

impl StopSet {
    pub fn new() -> Self {
        StopSet::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Park `order`. Orders without a stop direction are ignored.
    pub fn insert(&mut self, order: Order) {
        self.admitted += 1;
        let key = (order.stop_price, self.admitted);
        let stop = order.stop;
        let id = order.id;
        match stop {
            StopType::Loss => {
                self.loss.insert(key, order);
            }
            StopType::Entry => {
                self.entry.insert(key, order);
            }
            StopType::None => return,
        }
        self.index.insert(id, (stop, key.0, key.1));
    }

    pub fn get(&self, id: u64) -> Option<&Order> {
        let (stop, price, adm) = self.index.get(&id)?;
        self.side(*stop)?.get(&(*price, *adm))
    }

    pub fn remove(&mut self, id: u64) -> Option<Order> {
        let (stop, price, adm) = self.index.remove(&id)?;
        match stop {
            StopType::Loss => self.loss.remove(&(price, adm)),
            StopType::Entry => self.entry.remove(&(price, adm)),
            StopType::None => None,
        }
    }

    /// Remove and return the next stop triggered by `last_price`.
    pub fn take_triggered(&mut self, last_price: Decimal) -> Option<Order> {
        let loss_key = self
            .loss
            .range((last_price, 0)..)
            .next_back()
            .map(|((price, _), _)| *price)
            .and_then(|price| self.loss.range((price, 0)..=(price, u64::MAX)).next())
            .map(|(k, _)| *k);
        if let Some(key) = loss_key {
            return self.take(StopType::Loss, key);
        }

        let entry_key = self.entry.range(..=(last_price, u64::MAX)).next().map(|(k, _)| *k);
        entry_key.and_then(|key| self.take(StopType::Entry, key))
    }

    /// Parked orders in admission order.
    pub fn orders(&self) -> Vec<Order> {
        let mut all: Vec<(u64, &Order)> = self
            .loss
            .iter()
            .chain(self.entry.iter())
            .map(|((_, adm), o)| (*adm, o))
            .collect();
        all.sort_by_key(|(adm, _)| *adm);
        all.into_iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.loss.clear();
        self.entry.clear();
        self.index.clear();
    }

    fn side(&self, stop: StopType) -> Option<&BTreeMap<(Decimal, u64), Order>> {
        match stop {
            StopType::Loss => Some(&self.loss),
            StopType::Entry => Some(&self.entry),
            StopType::None => None,
        }
    }

    fn take(&mut self, stop: StopType, key: (Decimal, u64)) -> Option<Order> {
        let order = match stop {
            StopType::Loss => self.loss.remove(&key),
            StopType::Entry => self.entry.remove(&key),
            StopType::None => None,
        }?;
        self.index.remove(&order.id);
        Some(order)
    }
}
