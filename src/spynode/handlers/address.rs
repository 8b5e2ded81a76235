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

use crate::{
    base::RwLock,
    spynode::Shared,
    storage::PeerRepository,
    wire::{Message, MsgAddr},
    Result,
};
use std::sync::Arc;

/// Collects the addresses announced by peers.
pub struct AddressHandler {
    peers: Arc<RwLock<PeerRepository>>,
}

impl AddressHandler {
    pub fn new(shared: &Shared) -> Self {
        AddressHandler {
            peers: shared.peers.clone(),
        }
    }

    pub fn handle(&self, msg: &MsgAddr) -> Result<Vec<Message>> {
        let mut peers = self.peers.write();
        let added = msg
            .addr_list
            .iter()
            .filter(|addr| peers.add(&addr.address()))
            .count();
        if added > 0 {
            debug!("[peers] {} new peer addresses", added);
        }
        Ok(vec![])
    }
}
