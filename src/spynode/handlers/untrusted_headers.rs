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

//! Verification of the headers sent by an untrusted peer.
//!
//! The reply to our locator must start close to our tip and be linked.
//! Untrusted headers never touch the local chain.

use crate::{
    base::RwLock,
    spynode::{untrusted_state::UntrustedState, Shared, UNTRUSTED_HEADER_DELTA},
    storage::{BlockRepository, PeerRepository},
    wire::{Message, MsgHeaders},
    Error, ErrorKind, Result,
};
use std::sync::Arc;

fn violation(reason: String) -> Error {
    Error::new_ext(ErrorKind::ProtocolViolation, reason)
}

pub struct UntrustedHeadersHandler {
    address: String,
    blocks: Arc<RwLock<BlockRepository>>,
    peers: Arc<RwLock<PeerRepository>>,
}

impl UntrustedHeadersHandler {
    pub fn new(address: &str, shared: &Shared) -> Self {
        UntrustedHeadersHandler {
            address: address.to_owned(),
            blocks: shared.blocks.clone(),
            peers: shared.peers.clone(),
        }
    }

    pub fn handle(&self, state: &mut UntrustedState, msg: &MsgHeaders) -> Result<Vec<Message>> {
        if state.is_ready() {
            return Ok(vec![]);
        }
        if state.headers_requested().is_none() {
            debug!("[untrusted] {} sent unsolicited headers", self.address);
            return Ok(vec![]);
        }

        let first = msg
            .headers
            .first()
            .ok_or_else(|| violation("peer returned zero headers".to_owned()))?;

        let hash = first.block_hash();
        let (height, last_height) = {
            let blocks = self.blocks.read();
            let height = blocks
                .height(&hash)
                .ok_or_else(|| violation(format!("peer returned unknown header {}", hash)))?;
            (height, blocks.last_height())
        };

        if height < last_height.saturating_sub(UNTRUSTED_HEADER_DELTA + 1) {
            self.peers.write().update_score(&self.address, -1);
            return Err(violation(format!(
                "peer returned header at low height {} (tip {})",
                height, last_height
            )));
        }

        let mut prev = hash;
        for header in &msg.headers[1..] {
            if header.prev_block != prev {
                return Err(violation(format!(
                    "peer returned unlinked header {}",
                    header.block_hash()
                )));
            }
            prev = header.block_hash();
        }

        debug!("[untrusted] {} verified at height {}", self.address, height);
        state.clear_headers_requested();
        state.set_verified();
        Ok(vec![])
    }
}
