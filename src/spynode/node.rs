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

//! Trusted node engine.
//!
//! The trusted node is the only source of chain data. It owns the chain
//! state transitions that follow a message (sync requests, block
//! processing, in-sync notification) and is the single consumer of the
//! txs received by every connection.

use super::{
    handlers::Dispatcher,
    listener::{Listener, TxData, TxState, TxUpdate},
    requests::{build_header_request, GetDataBatch},
    tracker::TxTracker,
    Config, Shared, TX_REQUEST_EXPIRY,
};
use crate::{
    base::timestamp_millis,
    channel::{GatedChannel, Receiver},
    crypto::Hash32,
    storage::Storage,
    wire::{BlockHeader, InvType, Message, MsgBlock},
    Error, ErrorKind, Result,
};
use std::sync::Arc;

/// Received txs waiting to be processed.
const INCOMING_TX_CAPACITY: usize = 100;

/// Max locator hashes of our header requests.
const MAX_HEADER_LOCATORS: usize = 50;

/// Headers are requested again once fewer blocks than this are pending.
const HEADER_REQUEST_THRESHOLD: usize = 5;

pub struct Node {
    shared: Shared,
    dispatcher: Dispatcher,
    tracker: Arc<TxTracker>,
    listener: Arc<dyn Listener>,
    incoming: Receiver<TxData>,
    /// Relevant tx events for the business logic.
    events: GatedChannel<TxData>,
    /// Status changes of the reported txs.
    updates: GatedChannel<TxUpdate>,
}

fn remove_hash(list: &mut Vec<Hash32>, hash: &Hash32) -> bool {
    match list.iter().position(|item| item == hash) {
        Some(index) => {
            list.swap_remove(index);
            true
        }
        None => false,
    }
}

impl Node {
    pub fn new(config: Config, storage: Arc<dyn Storage>, listener: Arc<dyn Listener>) -> Result<Self> {
        let shared = Shared::new(config, storage);
        let incoming = shared.tx_channel.open(INCOMING_TX_CAPACITY)?;
        let tracker = shared.register_tracker();
        let dispatcher = Dispatcher::new(&shared, tracker.clone());
        Ok(Node {
            shared,
            dispatcher,
            tracker,
            listener,
            incoming,
            events: GatedChannel::new(),
            updates: GatedChannel::new(),
        })
    }

    /// Restore the repositories and the sync position.
    pub fn load(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let mut blocks = self.shared.blocks.write();
        blocks.load()?;
        self.shared.txs.write().load()?;
        self.shared.peers.write().load()?;

        state.set_last_hash(blocks.last_hash());
        info!("[node] loaded blocks to height {}", blocks.last_height());
        match blocks.height(&self.shared.config.start_hash) {
            Some(height) => {
                state.set_start_height(height);
                info!("[node] start block at height {}", height);
            }
            None => info!("[node] start block not found yet"),
        }
        Ok(())
    }

    /// Components shared with the untrusted connections.
    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().is_ready()
    }

    pub fn last_height(&self) -> u32 {
        self.shared.blocks.read().last_height()
    }

    pub fn block_hash(&self, height: u32) -> Result<Hash32> {
        self.shared.blocks.read().hash(height)
    }

    /// Up to `max_count + 1` committed headers from `height`. Without a
    /// height the last `max_count` ones are returned.
    pub fn get_headers(&self, height: Option<u32>, max_count: u32) -> Result<Vec<BlockHeader>> {
        let blocks = self.shared.blocks.read();
        let last_height = blocks.last_height();
        let start = height.unwrap_or_else(|| last_height.saturating_sub(max_count));
        if start > last_height {
            return Ok(vec![]);
        }
        let end = last_height.min(start.saturating_add(max_count));
        (start..=end).map(|height| blocks.header(height)).collect()
    }

    /// Open the outbound channels, returning their receivers.
    pub fn open_channels(&self, capacity: usize) -> Result<(Receiver<TxData>, Receiver<TxUpdate>)> {
        let events = self.events.open(capacity)?;
        let updates = self.updates.open(capacity)?;
        Ok((events, updates))
    }

    /// Close every channel and stop the tracker.
    pub fn close(&self) {
        self.tracker.stop();
        for result in [
            self.shared.tx_channel.close(),
            self.events.close(),
            self.updates.close(),
        ] {
            if let Err(err) = result {
                trace!("[node] closing channel: {}", err);
            }
        }
    }

    /// Persist the repositories.
    pub fn save(&self) -> Result<()> {
        let _state = self.shared.state.lock();
        self.shared.blocks.read().save()?;
        self.shared.txs.read().save()?;
        self.shared.peers.read().save()?;
        debug!("[node] repositories saved");
        Ok(())
    }

    fn send_event(&self, event: TxData) {
        if let Err(err) = self.events.add(event) {
            debug!("[node] tx event dropped: {}", err);
        }
    }

    fn send_update(&self, update: TxUpdate) {
        if let Err(err) = self.updates.add(update) {
            debug!("[node] tx update dropped: {}", err);
        }
    }

    /// Handle a message from the trusted peer.
    ///
    /// Received txs are queued for [Node::process_unconfirmed_txs], which
    /// must be called after each message: once the queue is full the tx
    /// handler blocks until it is drained.
    pub fn handle_message(&self, msg: Message) -> Result<Vec<Message>> {
        self.dispatcher.dispatch(msg)
    }

    /// Periodic housekeeping. Returns the messages to send to the peer.
    pub fn check(&self) -> Result<Vec<Message>> {
        let mut out = vec![];
        let mut state = self.shared.state.lock();
        if !state.version_received() {
            return Ok(out);
        }

        if !state.handshake_complete() {
            let request = build_header_request(
                state.protocol_version(),
                &self.shared.blocks.read(),
                Some(&*state),
                0,
                MAX_HEADER_LOCATORS,
            )?;
            debug!("[node] requesting headers");
            out.push(Message::GetHeaders(request));
            state.mark_headers_requested(timestamp_millis());
            state.set_handshake_complete();
        }

        if !state.is_ready() {
            if state.headers_requested().is_none()
                && state.total_block_request_count() < HEADER_REQUEST_THRESHOLD
            {
                let request = build_header_request(
                    state.protocol_version(),
                    &self.shared.blocks.read(),
                    Some(&*state),
                    1,
                    MAX_HEADER_LOCATORS,
                )?;
                if let Some(hash) = request.block_locator_hashes.first() {
                    debug!("[node] requesting headers after {}", hash);
                }
                out.push(Message::GetHeaders(request));
                state.mark_headers_requested(timestamp_millis());
            }
            return Ok(out);
        }

        if !state.sent_send_headers() {
            out.push(Message::SendHeaders);
            state.set_sent_send_headers();
        }
        if !state.addresses_requested() {
            out.push(Message::GetAddr);
            state.set_addresses_requested();
        }

        let mut notify = false;
        if self.shared.config.request_mempool && !state.mempool_requested() {
            out.push(Message::MemPool);
            state.set_mempool_requested();
        } else {
            if !state.was_in_sync() {
                match self.shared.reorgs.lock().clear_active() {
                    Err(err) if err.kind != ErrorKind::ResourceNotFound => return Err(err),
                    _ => state.set_was_in_sync(),
                }
            }
            if !state.notified_sync() {
                state.set_notified_sync();
                notify = true;
            }
        }
        drop(state);

        if notify {
            self.listener.handle_in_sync();
        }
        out.extend(self.tracker.check(&self.shared.mempool)?);
        Ok(out)
    }

    /// Process the received blocks in chain order and request the next ones.
    ///
    /// While a refeed is running the main feed waits.
    pub fn process_blocks(&self) -> Result<Vec<Message>> {
        let mut batch = GetDataBatch::new();

        if self.shared.refeeder.is_active() {
            if let Some((block, height)) = self.shared.refeeder.take_block() {
                self.provide_block(&block, height)?;
                let blocks = self.shared.blocks.read();
                if height >= blocks.last_height() {
                    info!("[node] refeed complete at height {}", height);
                    self.shared.refeeder.clear(height);
                } else {
                    let next = blocks.hash(height + 1)?;
                    self.shared.refeeder.increment(height + 1, next);
                }
            }
            if let Some(hash) = self.shared.refeeder.block_to_request() {
                batch.add(InvType::Block, hash)?;
            }
            return Ok(batch.finish());
        }

        loop {
            let block = match self.shared.state.lock().next_block() {
                Some(block) => block,
                None => break,
            };
            self.process_block(&block)?;
        }

        let mut state = self.shared.state.lock();
        while let Some(hash) = state.next_block_to_request() {
            batch.add(InvType::Block, hash)?;
        }
        Ok(batch.finish())
    }

    /// Commit a block on top of the chain.
    ///
    /// Returns false if the block is known, not the next one or has a bad
    /// merkle root. None of these is an error, the block is just dropped.
    pub fn process_block(&self, block: &MsgBlock) -> Result<bool> {
        let hash = block.block_hash();
        let header = block.header;

        let mut state = self.shared.state.lock();
        let mut blocks = self.shared.blocks.write();
        if let Some(height) = blocks.height(&hash) {
            warn!("[node] already have block {} at height {}", hash, height);
            return Ok(false);
        }
        if header.prev_block != blocks.last_hash() {
            warn!("[node] block {} is not next (previous {})", hash, header.prev_block);
            return Ok(false);
        }
        if !block.is_merkle_root_valid() {
            warn!("[node] invalid merkle root for block {}", hash);
            return Ok(false);
        }

        blocks.add(&header)?;
        if state.is_ready() {
            blocks.save()?;
        }
        let height = blocks.last_height();
        self.listener.handle_headers(height, &header);
        trace!(
            "[node] processing block {} ({} txs) at height {}",
            hash,
            block.transactions.len(),
            height
        );

        let ready = state.is_ready();
        let mut txs = self.shared.txs.write();
        let mut unconfirmed = txs.unconfirmed();
        let mut txids = Vec::with_capacity(block.transactions.len());
        let mut events = vec![];
        let mut updates = vec![];
        for tx in &block.transactions {
            let txid = tx.tx_hash();
            txids.push(txid);

            let in_unconfirmed = remove_hash(&mut unconfirmed, &txid);
            let in_mempool = ready && self.shared.mempool.remove_transaction(&txid);

            if in_unconfirmed {
                let safe = !txs.is_unsafe(&txid);
                txs.add(&txid, height)?;
                updates.push(TxUpdate::new(
                    txid,
                    TxState {
                        safe,
                        unsafe_: !safe,
                        cancelled: false,
                        confirmed_height: Some(height),
                    },
                ));
                continue;
            }
            if in_mempool {
                continue;
            }

            let conflicts = self.shared.mempool.conflicting(tx);
            for conflict in &conflicts {
                if !unconfirmed.contains(conflict) {
                    continue;
                }
                info!("[node] tx {} cancelled by confirmed {}", conflict, txid);
                txs.mark_unsafe(conflict);
                updates.push(TxUpdate::new(
                    *conflict,
                    TxState {
                        unsafe_: true,
                        cancelled: true,
                        ..Default::default()
                    },
                ));
            }

            if self.listener.is_relevant(tx) {
                txs.add(&txid, height)?;
                events.push(TxData {
                    tx: tx.clone(),
                    trusted: true,
                    safe: conflicts.is_empty(),
                    confirmed_height: Some(height),
                });
            }
        }

        self.cleanup_block(&txids);

        if !state.is_ready() && state.is_pending_sync() && state.block_requests_empty() {
            state.set_in_sync();
            info!("[node] blocks in sync at height {}", height);
        }
        txs.finalize_unconfirmed(&unconfirmed)?;
        drop(txs);
        drop(blocks);
        drop(state);

        for event in events {
            self.send_event(event);
        }
        for update in updates {
            self.send_update(update);
        }
        Ok(true)
    }

    /// Deliver an already committed block again.
    fn provide_block(&self, block: &MsgBlock, height: u32) -> Result<()> {
        if !block.is_merkle_root_valid() {
            warn!("[node] invalid merkle root for refeed block {}", block.block_hash());
            return Ok(());
        }
        self.listener.handle_headers(height, &block.header);

        let txs = self.shared.txs.read();
        for tx in block.transactions.iter().filter(|tx| self.listener.is_relevant(tx)) {
            txs.add(&tx.tx_hash(), height)?;
            self.send_event(TxData {
                tx: tx.clone(),
                trusted: true,
                safe: true,
                confirmed_height: Some(height),
            });
        }
        Ok(())
    }

    /// Forget the txs of a processed block in every connection tracker.
    pub fn cleanup_block(&self, txids: &[Hash32]) {
        self.shared.remove_tracked(txids);
    }

    /// Drain the received txs.
    pub fn process_unconfirmed_txs(&self) -> Result<()> {
        while let Some(data) = self.incoming.try_recv() {
            self.process_unconfirmed_tx(data)?;
        }
        Ok(())
    }

    pub fn process_unconfirmed_tx(&self, data: TxData) -> Result<()> {
        let txid = data.tx.tx_hash();
        if data.confirmed_height.is_some() {
            return Err(Error::new_ext(
                ErrorKind::Other,
                format!("unconfirmed tx {} with a confirmed height", txid),
            ));
        }

        self.shared.remove_tracked(&[txid]);
        let (conflicts, trusted, added) = self.shared.mempool.add_transaction(&data.tx, data.trusted);
        if !added {
            return Ok(());
        }

        let mut updates = vec![];
        let mut txs = self.shared.txs.write();
        if !conflicts.is_empty() {
            warn!("[node] found {} conflicts with {}", conflicts.len(), txid);
            let relevant: Vec<Hash32> = conflicts
                .iter()
                .filter(|id| txs.contains_unconfirmed(id))
                .copied()
                .collect();
            for conflict in relevant {
                txs.mark_unsafe(&conflict);
                updates.push(TxUpdate::new(
                    conflict,
                    TxState {
                        unsafe_: true,
                        ..Default::default()
                    },
                ));
            }
        }

        let event = if self.listener.is_relevant(&data.tx) {
            info!("[node] relevant tx {}", txid);
            if trusted {
                txs.mark_trusted(&txid);
            }
            let (added, newly_safe) = txs.add_unconfirmed(&txid, trusted, data.safe);
            if !conflicts.is_empty() {
                txs.mark_unsafe(&txid);
            }
            added.then(|| TxData {
                tx: data.tx,
                trusted,
                safe: (data.safe || newly_safe) && conflicts.is_empty(),
                confirmed_height: None,
            })
        } else {
            txs.remove_unconfirmed(&txid);
            None
        };
        drop(txs);

        for update in updates {
            self.send_update(update);
        }
        if let Some(event) = event {
            self.send_event(event);
        }
        Ok(())
    }

    /// Report the relevant txs that went `safe_tx_delay` without a conflict.
    pub fn check_safe_txs(&self, now: u64) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        let before = now.saturating_sub(self.shared.config.safe_tx_delay);
        let mempool = &self.shared.mempool;
        let safe = self
            .shared
            .txs
            .write()
            .new_safe(|txid| mempool.is_trusted(txid), before);
        for txid in safe {
            debug!("[node] tx {} is safe", txid);
            self.send_update(TxUpdate::new(
                txid,
                TxState {
                    safe: true,
                    ..Default::default()
                },
            ));
        }
        Ok(())
    }

    /// Forget the announced txs that were never delivered.
    pub fn expire_requests(&self, now: u64) -> usize {
        let expired = self
            .shared
            .mempool
            .expire_requests(now.saturating_sub(TX_REQUEST_EXPIRY));
        if expired > 0 {
            debug!("[node] {} tx announcements expired", expired);
        }
        expired
    }

    /// Fails with `RequestTimeout` when the peer stopped answering.
    pub fn check_timeouts(&self, now: u64) -> Result<()> {
        self.shared.state.lock().check_timeouts(now)
    }

    /// Deliver again the committed blocks from `height`.
    pub fn refeed(&self, height: u32) -> Result<()> {
        let hash = self.shared.blocks.read().hash(height)?;
        self.shared.refeeder.set_height(height, hash);
        Ok(())
    }

    /// Reconnection: the peer forgets what we asked.
    pub fn reset_connection(&self) {
        self.shared.state.lock().reset();
    }

    pub fn mark_connected(&self) {
        let mut state = self.shared.state.lock();
        state.mark_connected(timestamp_millis());
        drop(state);
        self.shared
            .peers
            .write()
            .update_time(&self.shared.config.node_address);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::{
        spynode::{config::tests::create_test_config, listener::MockListener},
        storage::{BlockRepository, MemoryStorage},
        wire::{
            block::tests::{create_block, create_chain},
            tx::tests::create_spend_tx,
            messages::MAX_BLOCK_HEADERS_PER_MSG,
            MsgHeaders, MsgVersion, Network, OutPoint,
        },
    };
    use std::collections::HashSet;

    /// Listener accepting any header, relevant txs are those in `relevant`.
    pub fn create_listener(relevant: Vec<Hash32>) -> MockListener {
        let relevant: HashSet<_> = relevant.into_iter().collect();
        let mut listener = MockListener::new();
        listener
            .expect_is_relevant()
            .returning(move |tx| relevant.contains(&tx.tx_hash()));
        listener.expect_handle_headers().returning(|_, _| ());
        listener.expect_handle_in_sync().returning(|| ());
        listener
    }

    /// Loaded node downloading every block after the genesis.
    pub fn create_node(listener: MockListener) -> (Arc<MemoryStorage>, Node, Vec<MsgBlock>) {
        let genesis = Network::MainNet.genesis_header().block_hash();
        let chain = create_chain(genesis, 1, 5, 0);
        let storage = Arc::new(MemoryStorage::new());
        let config = create_test_config(chain[0].block_hash());
        let node = Node::new(config, storage.clone(), Arc::new(listener)).unwrap();
        node.load().unwrap();
        (storage, node, chain)
    }

    fn feed_headers(node: &Node, chain: &[MsgBlock]) -> Vec<Message> {
        let mut out = vec![];
        for part in chain.chunks(MAX_BLOCK_HEADERS_PER_MSG) {
            let headers = MsgHeaders::new(part.iter().map(|block| block.header).collect());
            out.extend(node.handle_message(Message::Headers(headers)).unwrap());
        }
        out
    }

    fn feed_blocks(node: &Node, chain: &[MsgBlock]) {
        for block in chain {
            node.handle_message(Message::Block(Box::new(block.clone())))
                .unwrap();
            node.process_blocks().unwrap();
        }
    }

    /// Headers exhausted and every block processed.
    fn sync(node: &Node, chain: &[MsgBlock]) {
        feed_headers(node, chain);
        feed_blocks(node, chain);
        node.handle_message(Message::Headers(MsgHeaders::default()))
            .unwrap();
        assert!(node.is_ready());
    }

    /// Block on top of `prev` carrying `txs` after the coinbase.
    fn block_with(prev: &MsgBlock, height: u32, txs: Vec<crate::wire::MsgTx>) -> MsgBlock {
        let mut block = create_block(prev.block_hash(), height, 0);
        for tx in txs {
            block.add_transaction(tx);
        }
        block.header.merkle_root = block.merkle_root();
        block
    }

    #[test]
    fn handshake_and_sync_requests() {
        let (_, node, _) = create_node(create_listener(vec![]));
        assert!(node.check().unwrap().is_empty());

        node.handle_message(Message::Version(MsgVersion::default()))
            .unwrap();
        let first = node.check().unwrap();
        let second = node.check().unwrap();

        assert!(matches!(first.as_slice(), [Message::GetHeaders(_)]));
        assert!(second.is_empty());
    }

    #[test]
    fn ready_node_requests_peer_data_and_notifies_once() {
        let mut listener = MockListener::new();
        listener.expect_is_relevant().returning(|_| false);
        listener.expect_handle_headers().returning(|_, _| ());
        listener.expect_handle_in_sync().times(1).returning(|| ());
        let (_, node, chain) = create_node(listener);
        node.handle_message(Message::Version(MsgVersion::default()))
            .unwrap();
        node.check().unwrap();
        sync(&node, &chain);

        let messages = node.check().unwrap();
        let again = node.check().unwrap();

        assert_eq!(messages, vec![Message::SendHeaders, Message::GetAddr]);
        assert!(again.is_empty());
    }

    #[test]
    fn in_sync_after_last_pending_block() {
        let (_, node, chain) = create_node(create_listener(vec![]));
        feed_headers(&node, &chain);
        node.handle_message(Message::Headers(MsgHeaders::default()))
            .unwrap();
        assert!(!node.is_ready());

        feed_blocks(&node, &chain);

        assert!(node.is_ready());
        assert_eq!(node.last_height(), 5);
    }

    #[test]
    fn process_block_rejects_unusable_blocks() {
        let (_, node, chain) = create_node(create_listener(vec![]));
        let mut bad_root = chain[0].clone();
        bad_root.header.merkle_root = Hash32::default();

        assert!(!node.process_block(&chain[1]).unwrap());
        assert!(!node.process_block(&bad_root).unwrap());
        assert!(node.process_block(&chain[0]).unwrap());
        assert!(!node.process_block(&chain[0]).unwrap());
        assert_eq!(node.last_height(), 1);
    }

    #[test]
    fn relevant_confirmed_tx_is_reported() {
        let spend = create_spend_tx(OutPoint::new(Hash32::double_sha256(b"funding"), 0), 1);
        let (_, node, chain) = create_node(create_listener(vec![spend.tx_hash()]));
        let (events, _updates) = node.open_channels(10).unwrap();
        let block = block_with(&chain[0], 2, vec![spend.clone()]);
        node.process_block(&chain[0]).unwrap();

        node.process_block(&block).unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.tx, spend);
        assert_eq!(event.confirmed_height, Some(2));
        assert!(event.safe);
        assert!(events.try_recv().is_none());
        assert!(node.shared().txs.read().contains(&spend.tx_hash(), 2).unwrap());
    }

    #[test]
    fn unconfirmed_tx_then_confirmed() {
        let spend = create_spend_tx(OutPoint::new(Hash32::double_sha256(b"funding"), 0), 1);
        let txid = spend.tx_hash();
        let (_, node, chain) = create_node(create_listener(vec![txid]));
        let (events, updates) = node.open_channels(10).unwrap();
        node.process_block(&chain[0]).unwrap();

        node.process_unconfirmed_tx(TxData::unconfirmed(spend.clone(), true))
            .unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.confirmed_height, None);
        assert!(event.trusted);
        node.process_block(&block_with(&chain[0], 2, vec![spend]))
            .unwrap();

        let update = updates.try_recv().unwrap();
        assert_eq!(update.txid, txid);
        assert_eq!(update.state.confirmed_height, Some(2));
        assert!(update.state.safe);
        assert!(events.try_recv().is_none());
        assert!(!node.shared().txs.read().contains_unconfirmed(&txid));
    }

    #[test]
    fn double_spend_marks_relevant_tx_unsafe() {
        let outpoint = OutPoint::new(Hash32::double_sha256(b"funding"), 0);
        let first = create_spend_tx(outpoint, 1);
        let second = create_spend_tx(outpoint, 2);
        let (_, node, _) = create_node(create_listener(vec![first.tx_hash()]));
        let (events, updates) = node.open_channels(10).unwrap();

        node.process_unconfirmed_tx(TxData::unconfirmed(first.clone(), false))
            .unwrap();
        node.process_unconfirmed_tx(TxData::unconfirmed(second, false))
            .unwrap();

        assert_eq!(events.try_recv().unwrap().tx, first);
        let update = updates.try_recv().unwrap();
        assert_eq!(update.txid, first.tx_hash());
        assert!(update.state.unsafe_);
        assert!(!update.state.cancelled);
        assert!(node.shared().txs.read().is_unsafe(&first.tx_hash()));
    }

    #[test]
    fn confirmed_double_spend_cancels_tx() {
        let outpoint = OutPoint::new(Hash32::double_sha256(b"funding"), 0);
        let first = create_spend_tx(outpoint, 1);
        let second = create_spend_tx(outpoint, 2);
        let (_, node, chain) = create_node(create_listener(vec![first.tx_hash()]));
        let (_events, updates) = node.open_channels(10).unwrap();
        sync(&node, &chain);
        node.process_unconfirmed_tx(TxData::unconfirmed(first.clone(), true))
            .unwrap();

        node.process_block(&block_with(&chain[4], 6, vec![second]))
            .unwrap();

        let update = updates.try_recv().unwrap();
        assert_eq!(update.txid, first.tx_hash());
        assert!(update.state.cancelled);
    }

    #[test]
    fn safe_after_delay() {
        let spend = create_spend_tx(OutPoint::new(Hash32::double_sha256(b"funding"), 0), 1);
        let (_, node, chain) = create_node(create_listener(vec![spend.tx_hash()]));
        let (_events, updates) = node.open_channels(10).unwrap();
        sync(&node, &chain);
        node.process_unconfirmed_tx(TxData::unconfirmed(spend.clone(), true))
            .unwrap();

        node.check_safe_txs(timestamp_millis() + 1).unwrap();
        node.check_safe_txs(timestamp_millis() + 1).unwrap();

        let update = updates.try_recv().unwrap();
        assert_eq!(update.txid, spend.tx_hash());
        assert!(update.state.safe);
        assert!(updates.try_recv().is_none());
    }

    #[test]
    fn confirmed_height_is_rejected_as_unconfirmed() {
        let (_, node, _) = create_node(create_listener(vec![]));
        let mut data = TxData::unconfirmed(create_spend_tx(OutPoint::default(), 1), true);
        data.confirmed_height = Some(1);

        let err = node.process_unconfirmed_tx(data).unwrap_err();

        assert_eq!(err.kind, ErrorKind::Other);
    }

    #[test]
    fn received_txs_are_drained() {
        let spend = create_spend_tx(OutPoint::new(Hash32::double_sha256(b"funding"), 0), 1);
        let (_, node, chain) = create_node(create_listener(vec![spend.tx_hash()]));
        let (events, _updates) = node.open_channels(10).unwrap();
        sync(&node, &chain);

        node.handle_message(Message::Tx(spend.clone())).unwrap();
        node.process_unconfirmed_txs().unwrap();

        assert_eq!(events.try_recv().unwrap().tx, spend);
    }

    #[test]
    fn full_tx_queue_is_emptied_by_processing() {
        let (_, node, chain) = create_node(create_listener(vec![]));
        sync(&node, &chain);
        let spend = |n: usize| {
            let funding = Hash32::double_sha256(&n.to_le_bytes());
            create_spend_tx(OutPoint::new(funding, 0), 1)
        };
        for n in 0..INCOMING_TX_CAPACITY {
            node.handle_message(Message::Tx(spend(n))).unwrap();
        }
        let queued = node.incoming.len();

        node.process_unconfirmed_txs().unwrap();
        node.handle_message(Message::Tx(spend(INCOMING_TX_CAPACITY)))
            .unwrap();

        assert_eq!(queued, INCOMING_TX_CAPACITY);
        assert_eq!(node.incoming.len(), 1);
        assert_eq!(node.shared.mempool.len(), INCOMING_TX_CAPACITY);
    }

    #[test]
    fn refeed_walks_to_tip() {
        let (_, node, chain) = create_node(create_listener(vec![]));
        sync(&node, &chain);
        node.refeed(4).unwrap();

        let first = node.process_blocks().unwrap();
        node.handle_message(Message::Block(Box::new(chain[3].clone())))
            .unwrap();
        let second = node.process_blocks().unwrap();
        node.handle_message(Message::Block(Box::new(chain[4].clone())))
            .unwrap();
        node.process_blocks().unwrap();

        let requested = |messages: &[Message]| match messages {
            [Message::GetData(msg)] => msg.inv_list[0].hash,
            _ => panic!("expected a single getdata"),
        };
        assert_eq!(requested(&first), chain[3].block_hash());
        assert_eq!(requested(&second), chain[4].block_hash());
        assert!(!node.shared().refeeder.is_active());
    }

    #[test]
    fn headers_from_height() {
        let (_, node, chain) = create_node(create_listener(vec![]));
        sync(&node, &chain);

        let headers = node.get_headers(Some(2), 2).unwrap();
        let last = node.get_headers(None, 1).unwrap();

        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], chain[1].header);
        assert_eq!(last, vec![chain[3].header, chain[4].header]);
        assert!(node.get_headers(Some(10), 2).unwrap().is_empty());
    }

    #[test]
    fn reload_restores_position() {
        let (storage, node, chain) = create_node(create_listener(vec![]));
        sync(&node, &chain);

        let config = create_test_config(chain[0].block_hash());
        let reloaded = Node::new(config, storage, Arc::new(create_listener(vec![]))).unwrap();
        reloaded.load().unwrap();

        assert_eq!(reloaded.last_height(), 5);
        let state = reloaded.shared().state.lock();
        assert_eq!(state.start_height(), Some(1));
        assert_eq!(state.last_hash(), chain[4].block_hash());
    }

    #[test]
    fn reorg_end_to_end() {
        let genesis = Network::MainNet.genesis_header().block_hash();
        let chain = create_chain(genesis, 1, 9264, 0);
        let storage = Arc::new(MemoryStorage::new());
        let config = create_test_config(chain[0].block_hash());
        let node = Node::new(config, storage.clone(), Arc::new(create_listener(vec![]))).unwrap();
        node.load().unwrap();

        sync(&node, &chain);
        assert_eq!(node.last_height(), 9264);
        assert_eq!(node.block_hash(9264).unwrap(), chain[9263].block_hash());

        let fork = create_chain(chain[9259].block_hash(), 9261, 4, 1);
        feed_headers(&node, &fork);
        assert_eq!(node.last_height(), 9260);
        let reorg = node.shared().reorgs.lock().active().unwrap().unwrap();
        assert_eq!(reorg.block_height, 9260);
        assert_eq!(reorg.blocks.len(), 4);
        feed_blocks(&node, &fork);

        assert_eq!(node.last_height(), 9264);
        assert_eq!(node.block_hash(9264).unwrap(), fork[3].block_hash());
        node.shared().reorgs.lock().clear_active().unwrap();
        assert!(node.shared().reorgs.lock().active().unwrap().is_none());

        node.shared().blocks.read().save().unwrap();
        let mut reloaded = BlockRepository::new(Network::MainNet, storage);
        reloaded.load().unwrap();
        assert_eq!(reloaded.last_height(), 9264);
        assert_eq!(reloaded.last_hash(), fork[3].block_hash());
        for height in [1, 999, 1000, 1001, 9260] {
            let hash = chain[height as usize - 1].block_hash();
            assert_eq!(reloaded.hash(height).unwrap(), hash);
            assert_eq!(reloaded.height(&hash), Some(height));
        }
    }
}
