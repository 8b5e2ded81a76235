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

//! Header chain repository.
//!
//! Headers are kept in keys of `BLOCKS_PER_KEY` entries each, using the
//! fixed 80 bytes layout so that a revert only has to truncate the last
//! key. The latest (partial) key is cached in memory together with a map
//! from every known hash to its height.

use super::Storage;
use crate::{
    crypto::Hash32,
    wire::{BlockHeader, Network, BLOCK_HEADER_SIZE},
    Error, ErrorKind, Result,
};
use std::{collections::HashMap, sync::Arc};

/// Number of headers stored under each key.
pub const BLOCKS_PER_KEY: u32 = 1000;

fn build_key(height: u32) -> String {
    format!("spynode/blocks/{:08x}", height / BLOCKS_PER_KEY)
}

pub struct BlockRepository {
    net: Network,
    storage: Arc<dyn Storage>,
    /// Height of the tip.
    height: u32,
    /// Headers of the latest key, never empty.
    last_headers: Vec<BlockHeader>,
    heights: HashMap<Hash32, u32>,
}

impl BlockRepository {
    /// Repository holding only the `net` genesis header.
    pub fn new(net: Network, storage: Arc<dyn Storage>) -> Self {
        let mut repo = BlockRepository {
            net,
            storage,
            height: 0,
            last_headers: Vec::with_capacity(BLOCKS_PER_KEY as usize),
            heights: HashMap::new(),
        };
        repo.reset(net.genesis_header());
        repo
    }

    fn reset(&mut self, genesis: BlockHeader) {
        self.heights.clear();
        self.last_headers.clear();
        self.heights.insert(genesis.block_hash(), 0);
        self.last_headers.push(genesis);
        self.height = 0;
    }

    /// Restart from a synthetic genesis header with the given timestamp.
    pub fn initialize(&mut self, genesis_time: u32) {
        let genesis = BlockHeader {
            timestamp: genesis_time,
            ..Default::default()
        };
        self.reset(genesis);
    }

    /// Rebuild the height map and the cached tail from storage.
    /// Without any stored key the repository restarts from the network genesis.
    pub fn load(&mut self) -> Result<()> {
        self.heights.clear();
        let mut last_headers = vec![];
        let mut key_index = 0;
        loop {
            let headers = match self.read_key(key_index * BLOCKS_PER_KEY) {
                Ok(headers) => headers,
                Err(err) if err.kind == ErrorKind::ResourceNotFound => break,
                Err(err) => return Err(err),
            };
            if headers.is_empty() {
                break;
            }
            if key_index > 0 && last_headers.len() != BLOCKS_PER_KEY as usize {
                return Err(Error::new_ext(
                    ErrorKind::MalformedData,
                    format!(
                        "block key {} holds {} headers",
                        build_key((key_index - 1) * BLOCKS_PER_KEY),
                        last_headers.len()
                    ),
                ));
            }
            for (offset, header) in headers.iter().enumerate() {
                self.heights
                    .insert(header.block_hash(), key_index * BLOCKS_PER_KEY + offset as u32);
            }
            self.height = key_index * BLOCKS_PER_KEY + headers.len() as u32 - 1;
            last_headers = headers;
            key_index += 1;
        }

        if key_index == 0 {
            debug!("[blocks] no stored headers, adding {} genesis", self.net);
            self.reset(self.net.genesis_header());
        } else {
            self.last_headers = last_headers;
            debug!("[blocks] loaded headers up to height {}", self.height);
        }
        Ok(())
    }

    /// Append `header` on top of the tip.
    pub fn add(&mut self, header: &BlockHeader) -> Result<()> {
        let last_hash = self.last_hash();
        if header.prev_block != last_hash {
            return Err(Error::new_ext(
                ErrorKind::WrongPreviousHash,
                format!("header {} does not extend tip {}", header.block_hash(), last_hash),
            ));
        }
        if self.last_headers.len() == BLOCKS_PER_KEY as usize {
            self.save()?;
            self.last_headers.clear();
        }
        self.last_headers.push(*header);
        self.height += 1;
        self.heights.insert(header.block_hash(), self.height);
        Ok(())
    }

    pub fn last_height(&self) -> u32 {
        self.height
    }

    pub fn last_hash(&self) -> Hash32 {
        self.last_headers
            .last()
            .map(BlockHeader::block_hash)
            .unwrap_or_default()
    }

    pub fn tip_header(&self) -> BlockHeader {
        self.last_headers.last().copied().unwrap_or_default()
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.heights.contains_key(hash)
    }

    pub fn height(&self, hash: &Hash32) -> Option<u32> {
        self.heights.get(hash).copied()
    }

    pub fn header(&self, height: u32) -> Result<BlockHeader> {
        if height > self.height {
            return Err(Error::new_ext(
                ErrorKind::ResourceNotFound,
                format!("height {} beyond tip {}", height, self.height),
            ));
        }
        let back = (self.height - height) as usize;
        if back < self.last_headers.len() {
            return Ok(self.last_headers[self.last_headers.len() - 1 - back]);
        }
        let headers = self.read_full_key(height)?;
        Ok(headers[(height % BLOCKS_PER_KEY) as usize])
    }

    pub fn hash(&self, height: u32) -> Result<Hash32> {
        self.header(height).map(|header| header.block_hash())
    }

    pub fn time(&self, height: u32) -> Result<u32> {
        self.header(height).map(|header| header.timestamp)
    }

    /// Drop every header above `height`. The result is persisted.
    pub fn revert(&mut self, height: u32) -> Result<()> {
        if height > self.height {
            return Err(Error::new_ext(
                ErrorKind::ResourceNotFound,
                format!("revert height {} above tip {}", height, self.height),
            ));
        }

        for removed in (height + 1..=self.height).rev() {
            let hash = self.hash(removed)?;
            self.heights.remove(&hash);
        }

        let keep = (height % BLOCKS_PER_KEY + 1) as usize;
        let target_key = height / BLOCKS_PER_KEY;
        let tip_key = self.height / BLOCKS_PER_KEY;
        if target_key == tip_key {
            self.last_headers.truncate(keep);
        } else {
            for key in (target_key + 1..=tip_key).rev() {
                self.storage.remove(&build_key(key * BLOCKS_PER_KEY))?;
            }
            let mut headers = self.read_full_key(height)?;
            headers.truncate(keep);
            self.last_headers = headers;
        }
        self.height = height;
        self.save()
    }

    /// Persist the latest key.
    pub fn save(&self) -> Result<()> {
        let mut data = Vec::with_capacity(BLOCK_HEADER_SIZE * self.last_headers.len());
        for header in &self.last_headers {
            data.extend_from_slice(&header.serialize());
        }
        self.storage.write(&build_key(self.height), &data)
    }

    fn read_key(&self, height: u32) -> Result<Vec<BlockHeader>> {
        let data = self.storage.read(&build_key(height))?;
        BlockHeader::deserialize_list(&data)
    }

    fn read_full_key(&self, height: u32) -> Result<Vec<BlockHeader>> {
        let headers = self.read_key(height)?;
        if headers.len() != BLOCKS_PER_KEY as usize {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("block key {} holds {} headers", build_key(height), headers.len()),
            ));
        }
        Ok(headers)
    }
}
