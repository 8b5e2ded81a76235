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

//! Payloads of the control and inventory messages.

use super::{BlockHeader, MAX_INV_PER_MSG, PROTOCOL_VERSION};
use crate::{crypto::Hash32, Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Max headers carried by a single `headers` message.
pub const MAX_BLOCK_HEADERS_PER_MSG: usize = 2000;

/// Max locator hashes in a `getheaders`.
pub const MAX_BLOCK_LOCATORS_PER_MSG: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: Hash32,
}

impl InvVect {
    pub fn new(inv_type: InvType, hash: Hash32) -> Self {
        InvVect { inv_type, hash }
    }
}

fn push_inv_vect(list: &mut Vec<InvVect>, item: InvVect) -> Result<()> {
    if list.len() >= MAX_INV_PER_MSG {
        return Err(Error::new_ext(
            ErrorKind::MalformedData,
            format!("too many inventory vectors (max {})", MAX_INV_PER_MSG),
        ));
    }
    list.push(item);
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInv {
    pub inv_list: Vec<InvVect>,
}

impl MsgInv {
    pub fn add_inv_vect(&mut self, item: InvVect) -> Result<()> {
        push_inv_vect(&mut self.inv_list, item)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgGetData {
    pub inv_list: Vec<InvVect>,
}

impl MsgGetData {
    pub fn add_inv_vect(&mut self, item: InvVect) -> Result<()> {
        push_inv_vect(&mut self.inv_list, item)
    }

    pub fn is_full(&self) -> bool {
        self.inv_list.len() >= MAX_INV_PER_MSG
    }

    pub fn is_empty(&self) -> bool {
        self.inv_list.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddress {
    pub timestamp: u32,
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        NetAddress {
            timestamp: 0,
            services: 0,
            ip,
            port,
        }
    }

    /// `ip:port` form used as the peer repository key.
    pub fn address(&self) -> String {
        SocketAddr::new(self.ip, self.port).to_string()
    }
}

impl Default for NetAddress {
    fn default() -> Self {
        NetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgAddr {
    pub addr_list: Vec<NetAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgVersion {
    pub protocol_version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub last_block: i32,
    pub relay: bool,
}

impl Default for MsgVersion {
    fn default() -> Self {
        MsgVersion {
            protocol_version: PROTOCOL_VERSION,
            services: 0,
            timestamp: 0,
            addr_recv: NetAddress::default(),
            addr_from: NetAddress::default(),
            nonce: 0,
            user_agent: String::new(),
            last_block: 0,
            relay: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgHeaders {
    pub headers: Vec<BlockHeader>,
}

impl MsgHeaders {
    pub fn new(headers: Vec<BlockHeader>) -> Self {
        MsgHeaders { headers }
    }

    pub fn add_block_header(&mut self, header: BlockHeader) -> Result<()> {
        if self.headers.len() >= MAX_BLOCK_HEADERS_PER_MSG {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("too many block headers (max {})", MAX_BLOCK_HEADERS_PER_MSG),
            ));
        }
        self.headers.push(header);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgGetHeaders {
    pub protocol_version: u32,
    pub block_locator_hashes: Vec<Hash32>,
    /// Zero asks for as many headers as the peer is willing to send.
    pub hash_stop: Hash32,
}

impl MsgGetHeaders {
    pub fn new(protocol_version: u32) -> Self {
        MsgGetHeaders {
            protocol_version,
            block_locator_hashes: vec![],
            hash_stop: Hash32::default(),
        }
    }

    pub fn add_block_locator_hash(&mut self, hash: Hash32) -> Result<()> {
        if self.block_locator_hashes.len() >= MAX_BLOCK_LOCATORS_PER_MSG {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("too many locator hashes (max {})", MAX_BLOCK_LOCATORS_PER_MSG),
            ));
        }
        self.block_locator_hashes.push(hash);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPing {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPong {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgReject {
    /// Command of the rejected message.
    pub command: String,
    pub code: u8,
    pub reason: String,
    /// Rejected block or tx, zero for other commands.
    pub hash: Hash32,
}
