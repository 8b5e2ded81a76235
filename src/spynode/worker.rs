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

use super::{
    node::Node,
    requests::build_version,
    service::{NodeRequest, NodeRequestReceiver, Peer, PeerCommand},
    untrusted::UntrustedNode,
};
use crate::{
    base::timestamp_millis,
    channel::Sender,
    storage::peers,
    wire::{Message, MsgTx},
    ErrorKind, Result,
};
use async_std::task::{self, Context, Poll};
use futures::{future, prelude::*};
use rand::seq::SliceRandom;
use std::{collections::HashMap, time::Duration};

/// Period of the housekeeping checks (ms).
const CHECK_INTERVAL: u64 = 100;

/// Period of the untrusted peers selection (ms).
const MONITOR_INTERVAL: u64 = 2000;

/// An address is not tried again before this time (ms).
const ADDRESS_REUSE_DELAY: u64 = 600_000;

/// Score of the peers filling the first half of the untrusted slots.
const GOOD_SCORE: i32 = 5;

/// Tx being relayed and the number of peers it was sent to.
struct Broadcast {
    tx: MsgTx,
    count: usize,
}

pub struct NodeWorker {
    node: Node,
    untrusted: HashMap<String, UntrustedNode>,
    /// Last connection attempt of each untrusted address (ms).
    attempted: HashMap<String, u64>,
    /// Failed trusted connection attempts in a row.
    attempts: u32,
    /// Time of the next trusted connection attempt (ms).
    reconnect_at: Option<u64>,
    next_monitor: u64,
    broadcasts: Vec<Broadcast>,
    /// Requests receiver.
    rx_chan: NodeRequestReceiver,
    /// Commands for the transports.
    out_chan: Sender<PeerCommand>,
}

impl NodeWorker {
    pub fn new(node: Node, rx_chan: NodeRequestReceiver, out_chan: Sender<PeerCommand>) -> Self {
        NodeWorker {
            node,
            untrusted: HashMap::new(),
            attempted: HashMap::new(),
            attempts: 0,
            reconnect_at: None,
            next_monitor: 0,
            broadcasts: vec![],
            rx_chan,
            out_chan,
        }
    }

    fn command(&self, cmd: PeerCommand) {
        if let Err(err) = self.out_chan.send_sync(cmd) {
            warn!("[worker] outbound channel: {}", err);
        }
    }

    fn send(&self, peer: &Peer, messages: Vec<Message>) {
        for msg in messages {
            trace!("[worker] sending {} to {:?}", msg.command(), peer);
            self.command(PeerCommand::Send(peer.clone(), msg));
        }
    }

    fn disconnect(&mut self, peer: Peer) {
        match &peer {
            Peer::Trusted => {
                self.node.reset_connection();
                self.schedule_reconnect(timestamp_millis());
            }
            Peer::Untrusted(address) => {
                if let Some(node) = self.untrusted.remove(address) {
                    node.stop();
                }
            }
        }
        self.command(PeerCommand::Disconnect(peer));
    }

    /// Plan the next trusted connection attempt, unless one is already planned
    /// or the retries are exhausted.
    fn schedule_reconnect(&mut self, now: u64) {
        if self.reconnect_at.is_some() {
            return;
        }
        let config = self.node.shared().config.clone();
        if self.attempts >= config.max_retries {
            error!(
                "[worker] trusted node unreachable after {} attempts",
                self.attempts
            );
            return;
        }
        self.attempts += 1;
        self.reconnect_at = Some(now + config.retry_delay);
    }

    fn reconnect(&mut self, now: u64) {
        match self.reconnect_at {
            Some(time) if time <= now => {
                self.reconnect_at = None;
                info!("[worker] connecting to trusted node, attempt {}", self.attempts);
                self.command(PeerCommand::Connect(Peer::Trusted));
            }
            _ => (),
        }
    }

    fn version(&self) -> Message {
        let config = &self.node.shared().config;
        let nonce = rand::random::<u64>();
        Message::Version(build_version(&config.user_agent, self.node.last_height(), nonce))
    }

    /// Relay a tx to the trusted peer and to the verified untrusted ones.
    fn broadcast(&mut self, tx: MsgTx) {
        self.send(&Peer::Trusted, vec![Message::Tx(tx.clone())]);
        let mut count = 1;
        let mut outbound = vec![];
        for (address, node) in self.untrusted.iter_mut() {
            if node.is_ready() {
                outbound.push((address.clone(), node.broadcast(&[tx.clone()])));
                count += 1;
            }
        }
        for (address, messages) in outbound {
            self.send(&Peer::Untrusted(address), messages);
        }
        debug!("[worker] tx {} sent to {} peers", tx.tx_hash(), count);
        if count < self.node.shared().config.shotgun_count {
            self.broadcasts.push(Broadcast { tx, count });
        }
    }

    /// Random candidate that is neither connected, the trusted node nor tried recently.
    fn pick_address(&self, candidates: Vec<peers::Peer>, now: u64) -> Option<String> {
        let trusted = &self.node.shared().config.node_address;
        let candidates: Vec<String> = candidates
            .into_iter()
            .map(|peer| peer.address)
            .filter(|address| {
                address != trusted
                    && !self.untrusted.contains_key(address)
                    && self
                        .attempted
                        .get(address)
                        .map_or(true, |time| now.saturating_sub(*time) > ADDRESS_REUSE_DELAY)
            })
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    fn add_untrusted(&mut self, candidates: Vec<peers::Peer>, txs: &[MsgTx], now: u64) -> bool {
        let address = match self.pick_address(candidates, now) {
            Some(address) => address,
            None => return false,
        };
        debug!("[worker] connecting to untrusted {}", address);
        let mut node = UntrustedNode::new(&address, self.node.shared().clone());
        node.broadcast(txs);
        self.attempted.insert(address.clone(), now);
        self.untrusted.insert(address.clone(), node);
        self.command(PeerCommand::Connect(Peer::Untrusted(address)));
        true
    }

    /// Keep the configured number of untrusted peers, preferring the best scored.
    fn monitor_untrusted(&mut self, now: u64) {
        if now < self.next_monitor {
            return;
        }
        self.next_monitor = now + MONITOR_INTERVAL;
        if !self.node.is_ready() {
            return;
        }
        self.attempted
            .retain(|_, time| now.saturating_sub(*time) <= ADDRESS_REUSE_DELAY);

        let config = self.node.shared().config.clone();
        let mut desired = config.untrusted_count;
        if !self.broadcasts.is_empty() {
            desired = desired.max(config.shotgun_count);
        }
        let txs: Vec<MsgTx> = self.broadcasts.iter().map(|b| b.tx.clone()).collect();

        let mut added = 0;
        while self.untrusted.len() < desired / 2 {
            let candidates = self.node.shared().peers.read().get(GOOD_SCORE);
            if !self.add_untrusted(candidates, &txs, now) {
                break;
            }
            added += 1;
        }
        while self.untrusted.len() < desired {
            let candidates = self.node.shared().peers.read().get(1);
            if !self.add_untrusted(candidates, &txs, now) {
                break;
            }
            added += 1;
        }
        if txs.is_empty() {
            while self.untrusted.len() < desired {
                let candidates = self.node.shared().peers.read().unchecked();
                if !self.add_untrusted(candidates, &txs, now) {
                    break;
                }
                added += 1;
            }
        }

        if added > 0 {
            let shotgun_count = config.shotgun_count;
            for broadcast in self.broadcasts.iter_mut() {
                broadcast.count += added;
            }
            self.broadcasts
                .retain(|broadcast| broadcast.count <= shotgun_count);
        }
    }

    /// Handle a request. Only fatal errors are returned.
    fn handle_request(&mut self, req: NodeRequest) -> Result<()> {
        match req {
            NodeRequest::Connected(Peer::Trusted) => {
                info!("[worker] connected to trusted node");
                self.attempts = 0;
                self.reconnect_at = None;
                self.node.reset_connection();
                self.node.mark_connected();
                self.send(&Peer::Trusted, vec![self.version()]);
            }
            NodeRequest::Connected(Peer::Untrusted(address)) => {
                debug!("[worker] connected to untrusted {}", address);
                if !self.untrusted.contains_key(&address) {
                    let node = UntrustedNode::new(&address, self.node.shared().clone());
                    self.untrusted.insert(address.clone(), node);
                }
                self.send(&Peer::Untrusted(address), vec![self.version()]);
            }
            NodeRequest::Disconnected(Peer::Trusted) => {
                info!("[worker] trusted node disconnected");
                self.node.reset_connection();
                self.schedule_reconnect(timestamp_millis());
            }
            NodeRequest::Disconnected(Peer::Untrusted(address)) => {
                if let Some(node) = self.untrusted.remove(&address) {
                    node.stop();
                }
            }
            NodeRequest::Message(Peer::Trusted, msg) => {
                let command = msg.command();
                match self.node.handle_message(msg) {
                    Ok(replies) => self.send(&Peer::Trusted, replies),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => warn!("[worker] trusted {}: {}", command, err.to_string_full()),
                }
                let messages = self.node.process_blocks()?;
                self.send(&Peer::Trusted, messages);
            }
            NodeRequest::Message(Peer::Untrusted(address), msg) => {
                let result = match self.untrusted.get_mut(&address) {
                    Some(node) => node.handle_message(msg),
                    None => {
                        debug!("[worker] message from unknown peer {}", address);
                        return Ok(());
                    }
                };
                match result {
                    Ok(replies) => self.send(&Peer::Untrusted(address), replies),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) if err.kind == ErrorKind::ProtocolViolation => {
                        warn!("[worker] untrusted {}: {}", address, err.to_string_full());
                        self.disconnect(Peer::Untrusted(address));
                    }
                    Err(err) => warn!("[worker] untrusted {}: {}", address, err.to_string_full()),
                }
            }
            NodeRequest::Refeed(height) => {
                if let Err(err) = self.node.refeed(height) {
                    warn!("[worker] refeed from {}: {}", height, err.to_string_full());
                }
            }
            NodeRequest::BroadcastTx(tx) => self.broadcast(tx),
            NodeRequest::Stop => (),
        }
        self.node.process_unconfirmed_txs()
    }

    fn check(&mut self) -> Result<()> {
        self.check_at(timestamp_millis())
    }

    /// Periodic checks. Only fatal errors are returned.
    fn check_at(&mut self, now: u64) -> Result<()> {
        self.reconnect(now);
        self.node.expire_requests(now);

        let messages = self.node.check()?;
        self.send(&Peer::Trusted, messages);
        let messages = self.node.process_blocks()?;
        self.send(&Peer::Trusted, messages);
        self.node.check_safe_txs(now)?;
        if let Err(err) = self.node.check_timeouts(now) {
            warn!("[worker] trusted node: {}", err.to_string_full());
            self.disconnect(Peer::Trusted);
        }

        let mut dropped = vec![];
        let mut outbound = vec![];
        for (address, node) in self.untrusted.iter_mut() {
            match node.check() {
                Ok(messages) => outbound.push((address.clone(), messages)),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("[worker] untrusted {}: {}", address, err.to_string_full());
                    dropped.push(address.clone());
                    continue;
                }
            }
            if let Err(err) = node.check_timeouts(now) {
                warn!("[worker] untrusted {}: {}", address, err.to_string_full());
                dropped.push(address.clone());
            }
        }
        for (address, messages) in outbound {
            self.send(&Peer::Untrusted(address), messages);
        }
        for address in dropped {
            self.disconnect(Peer::Untrusted(address));
        }
        self.monitor_untrusted(now);
        Ok(())
    }

    /// Stop the connections and persist the repositories.
    fn shutdown(&mut self) {
        for (_, node) in self.untrusted.drain() {
            node.stop();
        }
        if let Err(err) = self.node.save() {
            error!("[worker] saving repositories: {}", err.to_string_full());
        }
    }

    fn on_error(result: Result<()>) -> Poll<()> {
        match result {
            Err(err) if err.is_fatal() => {
                error!("[worker] stopping: {}", err.to_string_full());
                Poll::Ready(())
            }
            Err(err) => {
                warn!("[worker] {}", err.to_string_full());
                Poll::Pending
            }
            Ok(()) => Poll::Pending,
        }
    }

    /// Worker asynchronous task.
    /// This can be stopped by submitting a `Stop` message to its input channel.
    pub async fn run(&mut self) {
        self.command(PeerCommand::Connect(Peer::Trusted));
        let mut sleep = Box::pin(task::sleep(Duration::from_millis(CHECK_INTERVAL)));

        let future = future::poll_fn(move |cx: &mut Context<'_>| -> Poll<()> {
            loop {
                match self.rx_chan.poll_next_unpin(cx) {
                    Poll::Ready(Some(NodeRequest::Stop)) => return Poll::Ready(()),
                    Poll::Ready(Some(req)) => {
                        if Self::on_error(self.handle_request(req)).is_ready() {
                            return Poll::Ready(());
                        }
                    }
                    Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Pending => break,
                }
            }

            while sleep.poll_unpin(cx).is_ready() {
                if Self::on_error(self.check()).is_ready() {
                    return Poll::Ready(());
                }
                sleep = Box::pin(task::sleep(Duration::from_millis(CHECK_INTERVAL)));
            }
            Poll::Pending
        });

        future.await
    }

    /// Worker synchronous task.
    pub fn run_sync(&mut self) {
        task::block_on(self.run());
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{simple_channel, Receiver},
        crypto::Hash32,
        spynode::{config::tests::create_test_config, node::tests::create_listener, Config},
        storage::MemoryStorage,
        wire::tx::tests::create_coinbase_tx,
    };
    use std::{collections::HashSet, sync::Arc};

    const TRUSTED: &str = "127.0.0.1:8333";

    fn create_worker(config: Config) -> (NodeWorker, Receiver<PeerCommand>) {
        let node = Node::new(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(create_listener(vec![])),
        )
        .unwrap();
        node.load().unwrap();
        let (_, rx_chan) = simple_channel();
        let (out_tx, out_chan) = simple_channel();
        (NodeWorker::new(node, rx_chan, out_tx), out_chan)
    }

    fn in_sync_worker(config: Config, scores: &[(&str, i32)]) -> (NodeWorker, Receiver<PeerCommand>) {
        let (worker, out_chan) = create_worker(config);
        let shared = worker.node.shared();
        shared.state.lock().set_in_sync();
        let mut peers = shared.peers.write();
        for (address, score) in scores {
            peers.add(address);
            if *score != 0 {
                peers.update_score(address, *score);
            }
        }
        drop(peers);
        (worker, out_chan)
    }

    fn drain(out_chan: &Receiver<PeerCommand>) -> Vec<PeerCommand> {
        let mut commands = vec![];
        while let Some(cmd) = out_chan.try_recv() {
            commands.push(cmd);
        }
        commands
    }

    fn untrusted_connects(commands: &[PeerCommand]) -> HashSet<String> {
        commands
            .iter()
            .filter_map(|cmd| match cmd {
                PeerCommand::Connect(Peer::Untrusted(address)) => Some(address.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unanswered_announcements_expire() {
        let (mut worker, _out) = create_worker(create_test_config(Hash32::default()));
        let now = timestamp_millis();
        let mempool = worker.node.shared().mempool.clone();
        mempool.add_request_at(&Hash32::double_sha256(b"old"), false, 0);
        mempool.add_request_at(&Hash32::double_sha256(b"new"), false, now);

        worker.check_at(now).unwrap();

        assert_eq!(mempool.len(), 1);
        assert!(mempool
            .add_request(&Hash32::double_sha256(b"old"), false)
            .1);
    }

    #[test]
    fn trusted_reconnect_gives_up_after_max_retries() {
        let config = Config {
            max_retries: 2,
            retry_delay: 1000,
            ..create_test_config(Hash32::default())
        };
        let (mut worker, out_chan) = create_worker(config);
        let mut connects = 0;

        for _ in 0..3 {
            worker
                .handle_request(NodeRequest::Disconnected(Peer::Trusted))
                .unwrap();
            worker.check_at(timestamp_millis()).unwrap();
            connects += drain(&out_chan).len();
            worker.check_at(timestamp_millis() + 2000).unwrap();
            connects += drain(&out_chan)
                .iter()
                .filter(|cmd| **cmd == PeerCommand::Connect(Peer::Trusted))
                .count();
        }
        worker
            .handle_request(NodeRequest::Connected(Peer::Trusted))
            .unwrap();
        let attempts = worker.attempts;
        worker
            .handle_request(NodeRequest::Disconnected(Peer::Trusted))
            .unwrap();

        assert_eq!(connects, 2);
        assert_eq!(attempts, 0);
        assert!(worker.reconnect_at.is_some());
    }

    #[test]
    fn untrusted_peers_are_picked_by_score() {
        let config = Config {
            untrusted_count: 4,
            ..create_test_config(Hash32::default())
        };
        let scores = [
            (TRUSTED, 5),
            ("10.0.0.1:8333", 5),
            ("10.0.0.2:8333", 5),
            ("10.0.0.3:8333", 1),
            ("10.0.0.4:8333", 0),
            ("10.0.0.5:8333", -1),
        ];
        let (mut worker, out_chan) = in_sync_worker(config, &scores);
        let now = timestamp_millis();

        worker.check_at(now).unwrap();
        let first = untrusted_connects(&drain(&out_chan));
        worker.check_at(now + MONITOR_INTERVAL).unwrap();
        let second = untrusted_connects(&drain(&out_chan));
        worker
            .handle_request(NodeRequest::Disconnected(Peer::Untrusted(
                "10.0.0.1:8333".to_owned(),
            )))
            .unwrap();
        worker.check_at(now + 2 * MONITOR_INTERVAL).unwrap();
        let third = untrusted_connects(&drain(&out_chan));

        let expected: HashSet<String> = scores[1..5]
            .iter()
            .map(|(address, _)| address.to_string())
            .collect();
        assert_eq!(first, expected);
        assert!(second.is_empty());
        assert!(third.is_empty());
        assert_eq!(worker.untrusted.len(), 3);
    }

    #[test]
    fn good_peers_fill_half_the_slots() {
        let config = Config {
            untrusted_count: 2,
            ..create_test_config(Hash32::default())
        };
        let scores = [
            ("10.0.0.1:8333", 5),
            ("10.0.0.2:8333", 1),
            ("10.0.0.3:8333", 1),
            ("10.0.0.4:8333", 1),
        ];
        let (mut worker, out_chan) = in_sync_worker(config, &scores);

        worker.check_at(timestamp_millis()).unwrap();
        let connects = untrusted_connects(&drain(&out_chan));

        assert_eq!(connects.len(), 2);
        assert!(connects.contains("10.0.0.1:8333"));
    }

    #[test]
    fn idle_monitor_before_sync() {
        let config = Config {
            untrusted_count: 2,
            ..create_test_config(Hash32::default())
        };
        let (mut worker, out_chan) = create_worker(config);
        worker.node.shared().peers.write().add("10.0.0.1:8333");

        worker.check_at(timestamp_millis()).unwrap();

        assert!(untrusted_connects(&drain(&out_chan)).is_empty());
    }

    #[test]
    fn broadcast_is_pending_until_shotgun_count() {
        let config = Config {
            shotgun_count: 3,
            ..create_test_config(Hash32::default())
        };
        let scores = [("10.0.0.1:8333", 1), ("10.0.0.2:8333", 1), ("10.0.0.3:8333", 1)];
        let (mut worker, out_chan) = in_sync_worker(config, &scores);
        let tx = create_coinbase_tx(7);

        worker
            .handle_request(NodeRequest::BroadcastTx(tx.clone()))
            .unwrap();
        let sent = drain(&out_chan);
        let pending = worker.broadcasts.len();
        worker.check_at(timestamp_millis()).unwrap();
        let connects = untrusted_connects(&drain(&out_chan));

        assert_eq!(sent, vec![PeerCommand::Send(Peer::Trusted, Message::Tx(tx))]);
        assert_eq!(pending, 1);
        assert_eq!(connects.len(), 3);
        assert!(worker.broadcasts.is_empty());
    }
}
