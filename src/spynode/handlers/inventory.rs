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

//! Inventory handlers.
//!
//! Every announced tx is requested from one peer only. Announcements for a
//! tx whose request is still in flight are handed to the tracker, so that
//! another peer can be asked if the first one never answers.

use crate::{
    base::Mutex,
    spynode::{
        mempool::MemPool, requests::GetDataBatch, state::State, tracker::TxTracker,
        untrusted_state::UntrustedState, Shared,
    },
    wire::{InvType, Message, MsgInv},
    Result,
};
use std::sync::Arc;

fn request_txs(
    mempool: &MemPool,
    tracker: &TxTracker,
    msg: &MsgInv,
    trusted: bool,
) -> Result<Vec<Message>> {
    let mut batch = GetDataBatch::new();
    for item in msg.inv_list.iter().filter(|item| item.inv_type == InvType::Tx) {
        let (already_have, should_request) = mempool.add_request(&item.hash, trusted);
        if already_have {
            continue;
        }
        if should_request {
            batch.add(InvType::Tx, item.hash)?;
        } else {
            tracker.add(&item.hash);
        }
    }
    Ok(batch.finish())
}

pub struct InvHandler {
    state: Arc<Mutex<State>>,
    mempool: Arc<MemPool>,
    tracker: Arc<TxTracker>,
}

impl InvHandler {
    pub fn new(shared: &Shared, tracker: Arc<TxTracker>) -> Self {
        InvHandler {
            state: shared.state.clone(),
            mempool: shared.mempool.clone(),
            tracker,
        }
    }

    pub fn handle(&self, msg: &MsgInv) -> Result<Vec<Message>> {
        if !self.state.lock().is_ready() {
            return Ok(vec![]);
        }
        request_txs(&self.mempool, &self.tracker, msg, true)
    }
}

pub struct UntrustedInvHandler {
    mempool: Arc<MemPool>,
    tracker: Arc<TxTracker>,
}

impl UntrustedInvHandler {
    pub fn new(shared: &Shared, tracker: Arc<TxTracker>) -> Self {
        UntrustedInvHandler {
            mempool: shared.mempool.clone(),
            tracker,
        }
    }

    pub fn handle(&self, state: &UntrustedState, msg: &MsgInv) -> Result<Vec<Message>> {
        if !state.is_ready() {
            return Ok(vec![]);
        }
        request_txs(&self.mempool, &self.tracker, msg, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::Hash32,
        spynode::tests::create_shared,
        wire::{InvVect, MsgGetData, PROTOCOL_VERSION},
    };

    fn inv_of(hashes: &[Hash32]) -> MsgInv {
        let mut msg = MsgInv::default();
        for hash in hashes {
            msg.add_inv_vect(InvVect::new(InvType::Tx, *hash)).unwrap();
        }
        msg
    }

    fn get_data(messages: &[Message]) -> &MsgGetData {
        match messages {
            [Message::GetData(msg)] => msg,
            _ => panic!("expected a single getdata"),
        }
    }

    #[test]
    fn not_ready_ignores_inventory() {
        let (_, shared) = create_shared(Hash32::default());
        let tracker = shared.register_tracker();
        let handler = InvHandler::new(&shared, tracker.clone());
        let txid = Hash32::double_sha256(b"tx");

        let messages = handler.handle(&inv_of(&[txid])).unwrap();

        assert!(messages.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn blocks_are_not_requested() {
        let (_, shared) = create_shared(Hash32::default());
        shared.state.lock().set_in_sync();
        let handler = InvHandler::new(&shared, shared.register_tracker());
        let mut msg = MsgInv::default();
        msg.add_inv_vect(InvVect::new(InvType::Block, Hash32::double_sha256(b"block")))
            .unwrap();

        let messages = handler.handle(&msg).unwrap();

        assert!(messages.is_empty());
    }

    #[test]
    fn announcements_from_many_peers_request_once() {
        let (_, shared) = create_shared(Hash32::default());
        shared.state.lock().set_in_sync();
        let trusted_tracker = shared.register_tracker();
        let untrusted_tracker = shared.register_tracker();
        let trusted = InvHandler::new(&shared, trusted_tracker.clone());
        let untrusted = UntrustedInvHandler::new(&shared, untrusted_tracker.clone());
        let mut peer = UntrustedState::new();
        peer.set_version_received(PROTOCOL_VERSION);
        peer.set_verified();
        let txids: Vec<_> = (0u8..3).map(|n| Hash32::double_sha256(&[n])).collect();

        let first = untrusted.handle(&peer, &inv_of(&txids)).unwrap();
        let second = trusted.handle(&inv_of(&txids)).unwrap();
        let third = untrusted.handle(&peer, &inv_of(&txids[..1])).unwrap();

        assert_eq!(get_data(&first).inv_list.len(), 3);
        assert!(second.is_empty());
        assert!(third.is_empty());
        assert_eq!(trusted_tracker.len(), 3);
        assert_eq!(untrusted_tracker.len(), 1);
    }

    #[test]
    fn untrusted_not_verified_ignores_inventory() {
        let (_, shared) = create_shared(Hash32::default());
        let handler = UntrustedInvHandler::new(&shared, shared.register_tracker());
        let peer = UntrustedState::new();

        let messages = handler
            .handle(&peer, &inv_of(&[Hash32::double_sha256(b"tx")]))
            .unwrap();

        assert!(messages.is_empty());
    }
}
