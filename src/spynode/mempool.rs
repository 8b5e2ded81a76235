// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Unconfirmed transactions seen on the network.
//!
//! The mempool is shared by every connection. It de-duplicates `inv`
//! announcements so that a tx is requested from one peer at a time, and
//! indexes received txs by spent outpoint to spot double spends.

use super::TX_REQUEST_RETRY;
use crate::{
    base::{timestamp_millis, Mutex},
    crypto::Hash32,
    wire::{MsgTx, OutPoint},
};
use std::collections::HashMap;

struct MemPoolTx {
    /// First seen (ms).
    time: u64,
    /// Empty until the tx body is received.
    outpoints: Vec<OutPoint>,
    trusted: bool,
}

impl MemPoolTx {
    fn new(time: u64, trusted: bool) -> Self {
        MemPoolTx {
            time,
            outpoints: vec![],
            trusted,
        }
    }

    fn is_populated(&self) -> bool {
        !self.outpoints.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    txs: HashMap<Hash32, MemPoolTx>,
    /// Spending txs by outpoint hash.
    inputs: HashMap<Hash32, Vec<Hash32>>,
    /// Outstanding requests time (ms).
    requests: HashMap<Hash32, u64>,
}

impl Inner {
    fn remove_transaction(&mut self, txid: &Hash32) -> bool {
        self.requests.remove(txid);
        let tx = match self.txs.remove(txid) {
            Some(tx) => tx,
            None => return false,
        };
        for outpoint in &tx.outpoints {
            let outpoint_hash = outpoint.outpoint_hash();
            if let Some(spenders) = self.inputs.get_mut(&outpoint_hash) {
                spenders.retain(|hash| hash != txid);
                if spenders.is_empty() {
                    self.inputs.remove(&outpoint_hash);
                }
            }
        }
        tx.is_populated()
    }
}

#[derive(Default)]
pub struct MemPool {
    inner: Mutex<Inner>,
}

impl MemPool {
    pub fn new() -> Self {
        MemPool::default()
    }

    /// Register an announcement of `txid`.
    ///
    /// Returns `(already_have, should_request)`. Only one caller is told to
    /// request a given tx until the request is older than `TX_REQUEST_RETRY`.
    pub fn add_request(&self, txid: &Hash32, trusted: bool) -> (bool, bool) {
        self.add_request_at(txid, trusted, timestamp_millis())
    }

    pub(crate) fn add_request_at(&self, txid: &Hash32, trusted: bool, now: u64) -> (bool, bool) {
        let mut inner = self.inner.lock();
        let tx = inner
            .txs
            .entry(*txid)
            .or_insert_with(|| MemPoolTx::new(now, trusted));
        tx.trusted |= trusted;
        if tx.is_populated() {
            return (true, false);
        }

        match inner.requests.get(txid).copied() {
            Some(time) if now.saturating_sub(time) <= TX_REQUEST_RETRY => (false, false),
            _ => {
                inner.requests.insert(*txid, now);
                (false, true)
            }
        }
    }

    /// Register a received tx.
    ///
    /// Returns `(conflicts, trusted, added)`: the txs already in the mempool
    /// spending the same outpoints, whether any trusted source vouched for
    /// the tx, and false if the tx was already there.
    pub fn add_transaction(&self, tx: &MsgTx, trusted: bool) -> (Vec<Hash32>, bool, bool) {
        let txid = tx.tx_hash();
        let mut inner = self.inner.lock();
        inner.requests.remove(&txid);

        let entry = inner
            .txs
            .entry(txid)
            .or_insert_with(|| MemPoolTx::new(timestamp_millis(), trusted));
        entry.trusted |= trusted;
        let trusted = entry.trusted;
        if entry.is_populated() {
            return (vec![], trusted, false);
        }
        entry.outpoints = tx
            .tx_in
            .iter()
            .map(|input| input.previous_outpoint)
            .collect();

        let mut conflicts = vec![];
        for input in &tx.tx_in {
            let spenders = inner
                .inputs
                .entry(input.previous_outpoint.outpoint_hash())
                .or_default();
            for spender in spenders.iter() {
                if *spender != txid && !conflicts.contains(spender) {
                    conflicts.push(*spender);
                }
            }
            if !spenders.contains(&txid) {
                spenders.push(txid);
            }
        }
        if !conflicts.is_empty() {
            debug!("[mempool] tx {} conflicts with {} txs", txid, conflicts.len());
        }
        (conflicts, trusted, true)
    }

    /// Returns true if the tx body had been received.
    pub fn remove_transaction(&self, txid: &Hash32) -> bool {
        self.inner.lock().remove_transaction(txid)
    }

    /// True only once the tx body has been received.
    pub fn transaction_exists(&self, txid: &Hash32) -> bool {
        self.inner
            .lock()
            .txs
            .get(txid)
            .map(MemPoolTx::is_populated)
            .unwrap_or(false)
    }

    pub fn is_trusted(&self, txid: &Hash32) -> bool {
        self.inner
            .lock()
            .txs
            .get(txid)
            .map(|tx| tx.trusted)
            .unwrap_or(false)
    }

    /// Txs spending the same outpoints as `tx`. They are removed from the pool.
    pub fn conflicting(&self, tx: &MsgTx) -> Vec<Hash32> {
        let mut inner = self.inner.lock();
        let mut result = vec![];
        for input in &tx.tx_in {
            let spenders = match inner.inputs.get(&input.previous_outpoint.outpoint_hash()) {
                Some(spenders) => spenders.clone(),
                None => continue,
            };
            for spender in spenders {
                if !result.contains(&spender) {
                    result.push(spender);
                }
                inner.remove_transaction(&spender);
            }
        }
        result
    }

    /// Number of known txs, received or just announced.
    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop announced txs never received and first seen before `before` (ms).
    pub fn expire_requests(&self, before: u64) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<Hash32> = inner
            .txs
            .iter()
            .filter(|(_, tx)| !tx.is_populated() && tx.time < before)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &expired {
            inner.remove_transaction(txid);
        }
        expired.len()
    }
}
