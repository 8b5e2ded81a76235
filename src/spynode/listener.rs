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

//! Downstream consumer interface and the events handed over to it.

use crate::{
    crypto::Hash32,
    wire::{BlockHeader, MsgTx},
};
#[cfg(test)]
use mockall::automock;

/// Business logic hooks called by the trusted node.
#[cfg_attr(test, automock)]
pub trait Listener: Send + Sync + 'static {
    /// Filter for the txs forwarded downstream.
    fn is_relevant(&self, tx: &MsgTx) -> bool;

    /// A new block has been committed at `height`.
    fn handle_headers(&self, height: u32, header: &BlockHeader);

    /// The node caught up with the trusted peer.
    fn handle_in_sync(&self);
}

/// Transaction event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxData {
    pub tx: MsgTx,
    /// Received from the trusted node.
    pub trusted: bool,
    /// No conflicting tx was seen for the safe delay.
    pub safe: bool,
    /// `None` while unconfirmed.
    pub confirmed_height: Option<u32>,
}

impl TxData {
    pub fn unconfirmed(tx: MsgTx, trusted: bool) -> Self {
        TxData {
            tx,
            trusted,
            safe: false,
            confirmed_height: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxState {
    pub safe: bool,
    /// A double spend attempt was seen.
    pub unsafe_: bool,
    /// A conflicting tx was confirmed.
    pub cancelled: bool,
    pub confirmed_height: Option<u32>,
}

/// Status change of a tx previously reported through [TxData].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxUpdate {
    pub txid: Hash32,
    pub state: TxState,
}

impl TxUpdate {
    pub fn new(txid: Hash32, state: TxState) -> Self {
        TxUpdate { txid, state }
    }
}
