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

//! Received transactions are queued for the trusted node, which owns every
//! mempool and repository update they cause.

use crate::{
    base::Mutex,
    channel::GatedChannel,
    spynode::{listener::TxData, state::State, untrusted_state::UntrustedState, Shared},
    wire::{Message, MsgTx},
    Result,
};
use std::sync::Arc;

fn push(tx_channel: &GatedChannel<TxData>, tx: MsgTx, trusted: bool) {
    let txid = tx.tx_hash();
    if let Err(err) = tx_channel.add(TxData::unconfirmed(tx, trusted)) {
        trace!("[txs] tx {} dropped: {}", txid, err);
    }
}

pub struct TxHandler {
    state: Arc<Mutex<State>>,
    tx_channel: Arc<GatedChannel<TxData>>,
}

impl TxHandler {
    pub fn new(shared: &Shared) -> Self {
        TxHandler {
            state: shared.state.clone(),
            tx_channel: shared.tx_channel.clone(),
        }
    }

    pub fn handle(&self, tx: MsgTx) -> Result<Vec<Message>> {
        if self.state.lock().is_ready() {
            push(&self.tx_channel, tx, true);
        }
        Ok(vec![])
    }
}

pub struct UntrustedTxHandler {
    tx_channel: Arc<GatedChannel<TxData>>,
}

impl UntrustedTxHandler {
    pub fn new(shared: &Shared) -> Self {
        UntrustedTxHandler {
            tx_channel: shared.tx_channel.clone(),
        }
    }

    pub fn handle(&self, state: &UntrustedState, tx: MsgTx) -> Result<Vec<Message>> {
        if state.is_ready() {
            push(&self.tx_channel, tx, false);
        }
        Ok(vec![])
    }
}
