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

//! Header chain synchronization engine.
//!
//! The trusted [Node] follows the chain of one full node: it accepts its
//! headers, unwinds forks, downloads the bodies of the blocks after the
//! configured start hash and hands the relevant transactions downstream.
//! Every [UntrustedNode] only corroborates: its headers are checked against
//! the local chain and its tx announcements feed the shared mempool.
//!
//! Shared components are guarded by their own locks. When more than one is
//! needed they are always taken in this order:
//!
//! 1. chain [State]
//! 2. block repository
//! 3. tx repository
//! 4. reorg repository
//! 5. peer repository
//!
//! [MemPool] and [BlockRefeeder] lock internally and never call out while
//! holding their lock, so they can be used at any point. [TxTracker::check]
//! asks the mempool while holding the tracker lock: a tracker lock is always
//! taken before the mempool one, never after.

pub mod config;
pub mod handlers;
pub mod listener;
pub mod mempool;
pub mod node;
pub mod refeeder;
pub mod requests;
pub mod service;
pub mod state;
pub mod tracker;
pub mod untrusted;
pub mod untrusted_state;
mod worker;

pub use config::Config;
pub use listener::{Listener, TxData, TxState, TxUpdate};
pub use mempool::MemPool;
pub use node::Node;
pub use refeeder::BlockRefeeder;
pub use service::{NodeRequest, NodeRequestSender, NodeService, Peer, PeerCommand};
pub use state::State;
pub use tracker::TxTracker;
pub use untrusted::UntrustedNode;
pub use untrusted_state::UntrustedState;

use crate::{
    base::{Mutex, RwLock},
    channel::GatedChannel,
    crypto::Hash32,
    storage::{BlockRepository, PeerRepository, ReorgRepository, Storage, TxRepository},
};
use std::sync::Arc;

/// Depth below the tip accepted for the first header returned by an untrusted peer.
pub const UNTRUSTED_HEADER_DELTA: u32 = 6;

/// Max blocks requested to the trusted peer at the same time.
pub const MAX_REQUESTED_BLOCKS: usize = 10;

/// Max bytes of received blocks waiting to be processed before new
/// requests are held back.
pub const MAX_PENDING_BLOCK_SIZE: usize = 100_000_000;

/// A tx request not answered within this time can be sent again (ms).
pub const TX_REQUEST_RETRY: u64 = 3000;

/// Announced txs never delivered are forgotten after this time (ms).
pub const TX_REQUEST_EXPIRY: u64 = 2 * TX_REQUEST_RETRY;

/// Tracked txs per `getdata` sent by the tracker.
pub const TRACKER_FLUSH_COUNT: usize = 100;

/// Components shared by the trusted node and the untrusted connections.
#[derive(Clone)]
pub struct Shared {
    pub config: Arc<Config>,
    pub state: Arc<Mutex<State>>,
    pub blocks: Arc<RwLock<BlockRepository>>,
    pub txs: Arc<RwLock<TxRepository>>,
    pub reorgs: Arc<Mutex<ReorgRepository>>,
    pub peers: Arc<RwLock<PeerRepository>>,
    pub mempool: Arc<MemPool>,
    /// Trackers of the live connections.
    pub trackers: Arc<Mutex<Vec<Arc<TxTracker>>>>,
    pub refeeder: Arc<BlockRefeeder>,
    /// Received txs waiting to be processed by the trusted node.
    pub tx_channel: Arc<GatedChannel<TxData>>,
}

impl Shared {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        let blocks = BlockRepository::new(config.net, storage.clone());
        Shared {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(State::new())),
            blocks: Arc::new(RwLock::new(blocks)),
            txs: Arc::new(RwLock::new(TxRepository::new(storage.clone()))),
            reorgs: Arc::new(Mutex::new(ReorgRepository::new(storage.clone()))),
            peers: Arc::new(RwLock::new(PeerRepository::new(storage))),
            mempool: Arc::new(MemPool::new()),
            trackers: Arc::new(Mutex::new(vec![])),
            refeeder: Arc::new(BlockRefeeder::new()),
            tx_channel: Arc::new(GatedChannel::new()),
        }
    }

    /// New tracker for a connection. It is dropped from the registry once stopped.
    pub fn register_tracker(&self) -> Arc<TxTracker> {
        let tracker = Arc::new(TxTracker::new());
        self.trackers.lock().push(tracker.clone());
        tracker
    }

    /// Forget `txids` in every live tracker.
    pub fn remove_tracked(&self, txids: &[Hash32]) {
        let mut trackers = self.trackers.lock();
        trackers.retain(|tracker| !tracker.is_stopped());
        for tracker in trackers.iter() {
            tracker.remove_list(txids);
        }
    }
}
