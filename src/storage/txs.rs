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

//! Relevant transaction ids.
//!
//! Confirmed ids are stored per block height, so that a reorg can tell
//! which transactions have to be rolled back. Unconfirmed ids live in
//! memory with their safety flags and are persisted as a single record.

use super::Storage;
use crate::{
    base::{
        serialize::{rmp_deserialize, rmp_serialize},
        timestamp_millis,
    },
    crypto::{Hash32, HASH32_SIZE},
    Error, ErrorKind, Result,
};
use std::{collections::HashMap, sync::Arc};

const UNCONFIRMED_KEY: &str = "spynode/txs/unconfirmed";

fn build_key(height: u32) -> String {
    format!("spynode/txs/{:08x}", height)
}

/// Unconfirmed transaction flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct UnconfirmedTx {
    /// First seen, or the instant the trusted node vouched for it.
    time: u64,
    /// A conflicting transaction was seen.
    unsafe_: bool,
    /// Safe notification already sent.
    safe: bool,
    /// Verified by the trusted node.
    trusted: bool,
}

impl UnconfirmedTx {
    fn new(safe: bool, unsafe_: bool, trusted: bool) -> Self {
        UnconfirmedTx {
            time: timestamp_millis(),
            unsafe_,
            safe,
            trusted,
        }
    }
}

pub struct TxRepository {
    storage: Arc<dyn Storage>,
    unconfirmed: HashMap<Hash32, UnconfirmedTx>,
}

/// Relevant ids of one block, borrowed from the repository.
///
/// The borrow keeps the repository locked until the block is either
/// removed or released.
#[must_use]
pub struct BlockTxs<'a> {
    repo: &'a TxRepository,
    height: u32,
    txids: Vec<Hash32>,
}

impl<'a> BlockTxs<'a> {
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn txids(&self) -> &[Hash32] {
        &self.txids
    }

    pub fn is_empty(&self) -> bool {
        self.txids.is_empty()
    }

    /// Remove the block record and give back its ids.
    pub fn remove(self) -> Result<Vec<Hash32>> {
        self.repo.storage.remove(&build_key(self.height))?;
        Ok(self.txids)
    }

    /// Leave the block record untouched.
    pub fn release(self) -> Vec<Hash32> {
        self.txids
    }
}

fn parse_txids(height: u32, data: &[u8]) -> Result<Vec<Hash32>> {
    if data.len() % HASH32_SIZE != 0 {
        return Err(Error::new_ext(
            ErrorKind::MalformedData,
            format!("tx key {:08x} has invalid size {}", height, data.len()),
        ));
    }
    data.chunks(HASH32_SIZE).map(Hash32::from_bytes).collect()
}

impl TxRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        TxRepository {
            storage,
            unconfirmed: HashMap::new(),
        }
    }

    /// Restore the unconfirmed set.
    pub fn load(&mut self) -> Result<()> {
        self.unconfirmed.clear();
        let data = match self.storage.read(UNCONFIRMED_KEY) {
            Ok(data) => data,
            Err(err) if err.kind == ErrorKind::ResourceNotFound => {
                debug!("[txs] no unconfirmed txs to load");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let entries: Vec<(Hash32, UnconfirmedTx)> = rmp_deserialize(&data)?;
        self.unconfirmed = entries.into_iter().collect();
        debug!("[txs] loaded {} unconfirmed txs", self.unconfirmed.len());
        Ok(())
    }

    /// Persist the unconfirmed set.
    pub fn save(&self) -> Result<()> {
        if self.unconfirmed.is_empty() {
            return self.storage.remove(UNCONFIRMED_KEY);
        }
        let entries: Vec<_> = self.unconfirmed.iter().map(|(k, v)| (*k, *v)).collect();
        let buf = rmp_serialize(&entries)?;
        self.storage.write(UNCONFIRMED_KEY, &buf)
    }

    fn read_block(&self, height: u32) -> Result<Vec<Hash32>> {
        match self.storage.read(&build_key(height)) {
            Ok(data) => parse_txids(height, &data),
            Err(err) if err.kind == ErrorKind::ResourceNotFound => Ok(vec![]),
            Err(err) => Err(err),
        }
    }

    fn write_block(&self, height: u32, txids: &[Hash32]) -> Result<()> {
        let data: Vec<u8> = txids.iter().flat_map(|h| h.as_bytes().to_vec()).collect();
        self.storage.write(&build_key(height), &data)
    }

    /// Add a confirmed id. Returns false if already present.
    pub fn add(&self, txid: &Hash32, height: u32) -> Result<bool> {
        let mut txids = self.read_block(height)?;
        if txids.contains(txid) {
            return Ok(false);
        }
        txids.push(*txid);
        self.write_block(height, &txids)?;
        Ok(true)
    }

    /// Remove a confirmed id. Returns false if it was not there.
    pub fn remove(&self, txid: &Hash32, height: u32) -> Result<bool> {
        let mut txids = self.read_block(height)?;
        let len = txids.len();
        txids.retain(|id| id != txid);
        if txids.len() == len {
            return Ok(false);
        }
        self.write_block(height, &txids)?;
        Ok(true)
    }

    pub fn contains(&self, txid: &Hash32, height: u32) -> Result<bool> {
        Ok(self.read_block(height)?.contains(txid))
    }

    pub fn get_block(&self, height: u32) -> Result<BlockTxs<'_>> {
        let txids = self.read_block(height)?;
        Ok(BlockTxs {
            repo: self,
            height,
            txids,
        })
    }

    /// Replace the ids of a block. An empty list removes the record.
    pub fn set_block(&self, txids: &[Hash32], height: u32) -> Result<()> {
        if txids.is_empty() {
            return self.clear_block(height);
        }
        self.write_block(height, txids)
    }

    pub fn clear_block(&self, height: u32) -> Result<()> {
        self.storage.remove(&build_key(height))
    }

    /// Returns `(added, newly_safe)`.
    pub fn add_unconfirmed(&mut self, txid: &Hash32, trusted: bool, safe: bool) -> (bool, bool) {
        match self.unconfirmed.get_mut(txid) {
            Some(tx) => {
                if trusted {
                    tx.trusted = true;
                }
                let newly_safe = safe && !tx.safe;
                if newly_safe {
                    tx.safe = true;
                }
                (false, newly_safe)
            }
            None => {
                self.unconfirmed
                    .insert(*txid, UnconfirmedTx::new(safe, false, trusted));
                (true, safe)
            }
        }
    }

    pub fn remove_unconfirmed(&mut self, txid: &Hash32) -> bool {
        self.unconfirmed.remove(txid).is_some()
    }

    pub fn contains_unconfirmed(&self, txid: &Hash32) -> bool {
        self.unconfirmed.contains_key(txid)
    }

    pub fn is_unsafe(&self, txid: &Hash32) -> bool {
        self.unconfirmed.get(txid).map(|tx| tx.unsafe_).unwrap_or(false)
    }

    pub fn unconfirmed(&self) -> Vec<Hash32> {
        self.unconfirmed.keys().copied().collect()
    }

    /// Keep only `remaining` as unconfirmed and persist the set.
    /// Ids not already tracked are recorded as trusted.
    pub fn finalize_unconfirmed(&mut self, remaining: &[Hash32]) -> Result<()> {
        let mut unconfirmed = HashMap::with_capacity(remaining.len());
        for txid in remaining {
            let tx = self
                .unconfirmed
                .get(txid)
                .copied()
                .unwrap_or_else(|| UnconfirmedTx::new(false, false, true));
            unconfirmed.insert(*txid, tx);
        }
        self.unconfirmed = unconfirmed;
        self.save()
    }

    /// Flag a conflict. Returns true if the tx was already tracked, that is
    /// it is relevant. Untracked ids are recorded as unsafe anyway.
    pub fn mark_unsafe(&mut self, txid: &Hash32) -> bool {
        match self.unconfirmed.get_mut(txid) {
            Some(tx) => {
                tx.unsafe_ = true;
                true
            }
            None => {
                self.unconfirmed
                    .insert(*txid, UnconfirmedTx::new(false, true, false));
                false
            }
        }
    }

    /// Record that the trusted node vouched for the tx. The safe delay
    /// restarts from now.
    pub fn mark_trusted(&mut self, txid: &Hash32) {
        if let Some(tx) = self.unconfirmed.get_mut(txid) {
            if !tx.trusted {
                debug!("[txs] tx marked trusted: {}", txid);
                tx.time = timestamp_millis();
                tx.trusted = true;
            }
        }
    }

    /// Txs that became safe: no conflict seen, vouched by the trusted node
    /// and seen before `before` (ms). They are marked so they are returned once.
    pub fn new_safe<F>(&mut self, is_trusted: F, before: u64) -> Vec<Hash32>
    where
        F: Fn(&Hash32) -> bool,
    {
        let mut result = vec![];
        for (txid, tx) in self.unconfirmed.iter_mut() {
            if tx.safe || tx.unsafe_ || tx.time >= before {
                continue;
            }
            if !tx.trusted && !is_trusted(txid) {
                continue;
            }
            tx.safe = true;
            result.push(*txid);
        }
        result
    }
}
