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

//! Connection to an untrusted peer.
//!
//! The peer must prove it follows our chain before its tx announcements
//! are used.

use super::{
    handlers::UntrustedDispatcher, requests::build_header_request, tracker::TxTracker,
    untrusted_state::UntrustedState, Shared, UNTRUSTED_HEADER_DELTA,
};
use crate::{
    base::timestamp_millis,
    wire::{Message, MsgTx},
    Result,
};
use std::sync::Arc;

/// Max locator hashes sent to an untrusted peer.
const MAX_HEADER_LOCATORS: usize = 10;

/// Score granted to a peer that passed verification.
const VERIFIED_SCORE: i32 = 5;

pub struct UntrustedNode {
    address: String,
    shared: Shared,
    state: UntrustedState,
    dispatcher: UntrustedDispatcher,
    tracker: Arc<TxTracker>,
    /// Broadcast txs held until the peer is verified.
    pending_txs: Vec<MsgTx>,
}

impl UntrustedNode {
    pub fn new(address: &str, shared: Shared) -> Self {
        let tracker = shared.register_tracker();
        let dispatcher = UntrustedDispatcher::new(address, &shared, tracker.clone());
        let mut state = UntrustedState::new();
        state.mark_connected(timestamp_millis());
        UntrustedNode {
            address: address.to_owned(),
            shared,
            state,
            dispatcher,
            tracker,
            pending_txs: vec![],
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Txs to relay. A verified peer gets them at once, the others once
    /// they pass verification.
    pub fn broadcast(&mut self, txs: &[MsgTx]) -> Vec<Message> {
        if self.state.is_ready() {
            return txs.iter().cloned().map(Message::Tx).collect();
        }
        self.pending_txs.extend_from_slice(txs);
        vec![]
    }

    pub fn handle_message(&mut self, msg: Message) -> Result<Vec<Message>> {
        self.dispatcher.dispatch(&mut self.state, msg)
    }

    pub fn check(&mut self) -> Result<Vec<Message>> {
        let mut out = vec![];
        if !self.state.version_received() {
            return Ok(out);
        }

        if !self.state.handshake_complete() {
            let request = build_header_request(
                self.state.protocol_version(),
                &self.shared.blocks.read(),
                None,
                UNTRUSTED_HEADER_DELTA,
                MAX_HEADER_LOCATORS,
            )?;
            debug!("[untrusted] {} requesting headers", self.address);
            out.push(Message::GetHeaders(request));
            self.state.mark_headers_requested(timestamp_millis());
            self.state.set_handshake_complete();
        }

        if !self.state.is_ready() {
            return Ok(out);
        }

        if !self.state.score_updated() {
            self.shared
                .peers
                .write()
                .update_score(&self.address, VERIFIED_SCORE);
            self.state.set_score_updated();
        }
        if !self.state.addresses_requested() {
            out.push(Message::GetAddr);
            self.state.set_addresses_requested();
        }
        if !self.state.mempool_requested() {
            out.push(Message::MemPool);
            self.state.set_mempool_requested();
        }
        out.extend(self.pending_txs.drain(..).map(Message::Tx));
        out.extend(self.tracker.check(&self.shared.mempool)?);
        Ok(out)
    }

    /// Fails with `RequestTimeout` when the peer is not answering.
    pub fn check_timeouts(&self, now: u64) -> Result<()> {
        self.state.check_timeouts(now)
    }

    /// The connection is gone, its tracker leaves the registry.
    pub fn stop(&self) {
        debug!("[untrusted] {} stopped", self.address);
        self.tracker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::Hash32,
        spynode::tests::create_shared,
        storage::blocks::tests::extend_repo,
        wire::{tx::tests::create_coinbase_tx, BlockHeader, MsgHeaders, MsgVersion},
    };

    const ADDRESS: &str = "10.0.0.2:8333";

    fn create_node(count: u32) -> (UntrustedNode, Vec<BlockHeader>) {
        let (_, shared) = create_shared(Hash32::default());
        let headers = extend_repo(&mut shared.blocks.write(), count, 0);
        shared.peers.write().add(ADDRESS);
        (UntrustedNode::new(ADDRESS, shared), headers)
    }

    #[test]
    fn idle_before_version() {
        let (mut node, _) = create_node(20);

        assert!(node.check().unwrap().is_empty());
    }

    #[test]
    fn headers_requested_below_tip() {
        let (mut node, headers) = create_node(20);
        node.handle_message(Message::Version(MsgVersion::default()))
            .unwrap();

        let messages = node.check().unwrap();

        match messages.as_slice() {
            [Message::GetHeaders(msg)] => {
                assert_eq!(msg.block_locator_hashes[0], headers[13].block_hash());
            }
            _ => panic!("expected a single getheaders"),
        }
        assert!(node.check().unwrap().is_empty());
    }

    #[test]
    fn verified_peer_is_scored_once() {
        let (mut node, headers) = create_node(20);
        node.handle_message(Message::Version(MsgVersion::default()))
            .unwrap();
        node.check().unwrap();
        node.handle_message(Message::Headers(MsgHeaders::new(headers[14..].to_vec())))
            .unwrap();

        let messages = node.check().unwrap();
        let again = node.check().unwrap();

        assert!(node.is_ready());
        assert_eq!(messages, vec![Message::GetAddr, Message::MemPool]);
        assert!(again.is_empty());
        let peers = node.shared.peers.read().get(0);
        assert_eq!(peers[0].score, VERIFIED_SCORE);
    }

    #[test]
    fn headers_without_version_do_not_verify() {
        let (mut node, headers) = create_node(20);

        let replies = node
            .handle_message(Message::Headers(MsgHeaders::new(headers[14..].to_vec())))
            .unwrap();

        assert!(replies.is_empty());
        assert!(!node.is_ready());
        assert!(node.check().unwrap().is_empty());
    }

    #[test]
    fn broadcast_waits_for_verification() {
        let (mut node, headers) = create_node(20);
        let tx = create_coinbase_tx(1);
        node.handle_message(Message::Version(MsgVersion::default()))
            .unwrap();
        node.check().unwrap();

        let early = node.broadcast(&[tx.clone()]);
        node.handle_message(Message::Headers(MsgHeaders::new(headers[14..].to_vec())))
            .unwrap();
        let messages = node.check().unwrap();
        let late = node.broadcast(&[tx.clone()]);

        assert!(early.is_empty());
        assert_eq!(
            messages,
            vec![Message::GetAddr, Message::MemPool, Message::Tx(tx.clone())]
        );
        assert_eq!(late, vec![Message::Tx(tx)]);
    }

    #[test]
    fn stop_drops_tracker() {
        let (node, _) = create_node(5);
        let txid = Hash32::double_sha256(b"tx");
        node.tracker.add(&txid);

        node.stop();
        node.shared.remove_tracked(&[txid]);

        assert!(node.tracker.is_stopped());
        assert!(node.shared.trackers.lock().is_empty());
    }
}
