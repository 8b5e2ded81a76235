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

//! Block header: the unit the whole synchronization engine reasons about.

use super::{read_u32, BLOCK_HEADER_SIZE};
use crate::{crypto::Hash32, Error, ErrorKind, Result};

/// Bitcoin block header. Identity is the double SHA-256 of its 80 bytes
/// serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(version: i32, prev_block: Hash32, merkle_root: Hash32, bits: u32, nonce: u32) -> Self {
        BlockHeader {
            version,
            prev_block,
            merkle_root,
            timestamp: 0,
            bits,
            nonce,
        }
    }

    /// Fixed size little endian serialization.
    pub fn serialize(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.prev_block.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("short block header ({} bytes)", buf.len()),
            ));
        }
        Ok(BlockHeader {
            version: read_u32(&buf[0..4]) as i32,
            prev_block: Hash32::from_bytes(&buf[4..36])?,
            merkle_root: Hash32::from_bytes(&buf[36..68])?,
            timestamp: read_u32(&buf[68..72]),
            bits: read_u32(&buf[72..76]),
            nonce: read_u32(&buf[76..80]),
        })
    }

    /// Parses a concatenation of serialized headers.
    pub fn deserialize_list(buf: &[u8]) -> Result<Vec<Self>> {
        if buf.len() % BLOCK_HEADER_SIZE != 0 {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("headers data length {} not aligned", buf.len()),
            ));
        }
        buf.chunks(BLOCK_HEADER_SIZE)
            .map(BlockHeader::deserialize)
            .collect()
    }

    pub fn block_hash(&self) -> Hash32 {
        Hash32::double_sha256(&self.serialize())
    }
}
