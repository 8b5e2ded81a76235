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

use super::{node::Node, worker::NodeWorker, Shared};
use crate::{
    channel::{simple_channel, Receiver, Sender},
    wire::{Message, MsgTx},
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Remote end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    Trusted,
    /// Untrusted peer by address.
    Untrusted(String),
}

/// Requests handled by the node worker.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRequest {
    /// Message received from a peer.
    Message(Peer, Message),
    /// The transport connected to the peer.
    Connected(Peer),
    /// The transport lost the peer.
    Disconnected(Peer),
    /// Deliver again the committed blocks from a height.
    Refeed(u32),
    /// Relay a tx to the trusted peer and to `shotgun_count` untrusted ones.
    BroadcastTx(MsgTx),
    Stop,
}

/// Instructions for the peer transports.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Open a connection, answered by `Connected` or `Disconnected`.
    Connect(Peer),
    Send(Peer, Message),
    /// Drop the connection, the peer misbehaved or stopped answering.
    Disconnect(Peer),
}

pub type NodeRequestSender = Sender<NodeRequest>;
pub type NodeRequestReceiver = Receiver<NodeRequest>;

/// Runs the trusted node and the untrusted connections on a worker thread.
///
/// The transports feed [NodeRequest]s and must drain the [PeerCommand]s.
pub struct NodeService {
    /// Worker object, present while stopped.
    worker: Option<NodeWorker>,
    /// Worker thread.
    handler: Option<JoinHandle<NodeWorker>>,
    /// To send requests to the worker.
    tx_chan: NodeRequestSender,
    /// Commands produced by the worker.
    out_chan: Receiver<PeerCommand>,
    shared: Shared,
    /// To check if the worker thread is still alive.
    canary: Arc<()>,
}

impl NodeService {
    pub fn new(node: Node) -> Self {
        let (tx_chan, rx_chan) = simple_channel::<NodeRequest>();
        let (out_tx, out_chan) = simple_channel::<PeerCommand>();
        let shared = node.shared().clone();

        NodeService {
            worker: Some(NodeWorker::new(node, rx_chan, out_tx)),
            handler: None,
            tx_chan,
            out_chan,
            shared,
            canary: Arc::new(()),
        }
    }

    pub fn start(&mut self) {
        debug!("[service] starting spynode service");
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                warn!("[service] service was already running");
                return;
            }
        };

        let mut canary = Arc::clone(&self.canary);
        let handle = thread::spawn(move || {
            let _ = Arc::get_mut(&mut canary);
            worker.run_sync();
            worker
        });
        self.handler = Some(handle);
    }

    pub fn stop(&mut self) {
        debug!("[service] stopping spynode service");
        match self.handler.take() {
            Some(handle) => {
                if let Err(err) = self.tx_chan.send_sync(NodeRequest::Stop) {
                    error!("[service] error stopping worker thread: {}", err);
                }
                match handle.join() {
                    Ok(worker) => self.worker = Some(worker),
                    Err(_) => error!("[service] worker thread panicked"),
                }
            }
            None => debug!("[service] service was not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        // Hack to intercept crashed subthreads.
        Arc::strong_count(&self.canary) == 2 && self.worker.is_none()
    }

    pub fn request_channel(&self) -> NodeRequestSender {
        self.tx_chan.clone()
    }

    pub fn outbound_channel(&self) -> Receiver<PeerCommand> {
        self.out_chan.clone()
    }

    /// Components shared with the worker.
    pub fn shared(&self) -> &Shared {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::Hash32,
        spynode::{config::tests::create_test_config, node::tests::create_listener},
        storage::{MemoryStorage, PeerRepository},
        wire::{MsgAddr, MsgVersion, NetAddress},
    };
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::Duration,
    };

    fn create_service_with_storage() -> (Arc<MemoryStorage>, NodeService) {
        let storage = Arc::new(MemoryStorage::new());
        let config = create_test_config(Hash32::default());
        let node = Node::new(config, storage.clone(), Arc::new(create_listener(vec![]))).unwrap();
        node.load().unwrap();
        (storage, NodeService::new(node))
    }

    fn create_service() -> NodeService {
        create_service_with_storage().1
    }

    #[test]
    fn start_stop() {
        let mut svc = create_service();

        svc.start();
        assert!(svc.is_running());

        svc.stop();
        assert!(!svc.is_running());
    }

    #[test]
    fn stopped_subthread() {
        let mut svc = create_service();

        svc.start();
        assert!(svc.is_running());

        svc.tx_chan.send_sync(NodeRequest::Stop).unwrap();
        std::thread::sleep(Duration::from_secs(1));

        assert!(!svc.is_running());
        svc.stop();
    }

    #[test]
    fn trusted_connection_flow() {
        let mut svc = create_service();
        let requests = svc.request_channel();
        let outbound = svc.outbound_channel();
        svc.start();

        let connect = outbound.recv_timeout_sync(Duration::from_secs(1)).unwrap();
        requests
            .send_sync(NodeRequest::Connected(Peer::Trusted))
            .unwrap();
        let version = outbound.recv_timeout_sync(Duration::from_secs(1)).unwrap();
        requests
            .send_sync(NodeRequest::Message(
                Peer::Trusted,
                Message::Version(MsgVersion::default()),
            ))
            .unwrap();
        let verack = outbound.recv_timeout_sync(Duration::from_secs(1)).unwrap();
        let getheaders = outbound.recv_timeout_sync(Duration::from_secs(1)).unwrap();
        svc.stop();

        assert_eq!(connect, PeerCommand::Connect(Peer::Trusted));
        assert!(matches!(version, PeerCommand::Send(Peer::Trusted, Message::Version(_))));
        assert_eq!(verack, PeerCommand::Send(Peer::Trusted, Message::VerAck));
        assert!(matches!(
            getheaders,
            PeerCommand::Send(Peer::Trusted, Message::GetHeaders(_))
        ));
    }

    #[test]
    fn peers_are_saved_on_stop() {
        let (storage, mut svc) = create_service_with_storage();
        let requests = svc.request_channel();
        let addr = NetAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8333);
        svc.start();

        requests
            .send_sync(NodeRequest::Message(
                Peer::Trusted,
                Message::Addr(MsgAddr {
                    addr_list: vec![addr],
                }),
            ))
            .unwrap();
        svc.stop();

        let mut peers = PeerRepository::new(storage);
        peers.load().unwrap();
        assert_eq!(peers.count(), 1);
    }
}
