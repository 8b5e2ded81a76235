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

//! Outgoing request builders.

use super::state::State;
use crate::{
    base::timestamp_secs,
    crypto::Hash32,
    storage::BlockRepository,
    wire::{
        InvType, InvVect, Message, MsgGetData, MsgGetHeaders, MsgVersion, NetAddress,
        PROTOCOL_VERSION,
    },
    Result,
};
use std::net::{IpAddr, Ipv4Addr};

/// Port advertised as ours. Inbound connections are never accepted.
const LOCAL_PORT: u16 = 9333;
const REMOTE_PORT: u16 = 8333;
/// Full node network service bit.
const SERVICE_NODE_NETWORK: u64 = 0x01;

/// `getheaders` locating our chain.
///
/// When `state` is given the locator starts with the queued request `delta`
/// entries back from the tail, then repository hashes at `tip - delta`
/// doubling `delta` each step, until more than `max` locators were added or
/// the genesis is reached.
pub fn build_header_request(
    protocol: u32,
    blocks: &BlockRepository,
    state: Option<&State>,
    delta: u32,
    max: usize,
) -> Result<MsgGetHeaders> {
    let mut msg = MsgGetHeaders::new(protocol);

    if let Some(hash) = state.and_then(|state| state.block_request_hash(delta as usize)) {
        msg.add_block_locator_hash(hash)?;
    }

    let last_height = blocks.last_height();
    let mut delta = delta;
    while delta <= last_height {
        msg.add_block_locator_hash(blocks.hash(last_height - delta)?)?;
        if msg.block_locator_hashes.len() > max || last_height <= delta {
            break;
        }
        delta = (delta * 2).max(1);
    }
    Ok(msg)
}

/// `version` announcing `height` as our best block.
pub fn build_version(user_agent: &str, height: u32, nonce: u64) -> MsgVersion {
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    MsgVersion {
        protocol_version: PROTOCOL_VERSION,
        services: SERVICE_NODE_NETWORK,
        timestamp: timestamp_secs() as i64,
        addr_recv: NetAddress::new(localhost, REMOTE_PORT),
        addr_from: NetAddress::new(localhost, LOCAL_PORT),
        nonce,
        user_agent: user_agent.to_owned(),
        last_block: height as i32,
        relay: true,
    }
}

/// Accumulates inventory requests into `getdata` messages, starting a new
/// message whenever the current one is full.
#[derive(Default)]
pub struct GetDataBatch {
    messages: Vec<Message>,
    current: MsgGetData,
}

impl GetDataBatch {
    pub fn new() -> Self {
        GetDataBatch::default()
    }

    pub fn add(&mut self, inv_type: InvType, hash: Hash32) -> Result<()> {
        let item = InvVect::new(inv_type, hash);
        if self.current.add_inv_vect(item).is_err() {
            self.flush();
            self.current.add_inv_vect(item)?;
        }
        Ok(())
    }

    /// Close the current message, if not empty.
    pub fn flush(&mut self) {
        if !self.current.is_empty() {
            let msg = std::mem::take(&mut self.current);
            self.messages.push(Message::GetData(msg));
        }
    }

    /// Items in all messages.
    pub fn len(&self) -> usize {
        let closed: usize = self
            .messages
            .iter()
            .map(|msg| match msg {
                Message::GetData(msg) => msg.inv_list.len(),
                _ => 0,
            })
            .sum();
        closed + self.current.inv_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(mut self) -> Vec<Message> {
        self.flush();
        self.messages
    }
}
