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

use super::{var_int_size, BlockHeader, MsgTx, BLOCK_HEADER_SIZE};
use crate::crypto::Hash32;

/// Full block as delivered by a `block` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgBlock {
    pub header: BlockHeader,
    pub transactions: Vec<MsgTx>,
}

impl MsgBlock {
    pub fn new(header: BlockHeader) -> Self {
        MsgBlock {
            header,
            transactions: vec![],
        }
    }

    pub fn add_transaction(&mut self, tx: MsgTx) {
        self.transactions.push(tx);
    }

    pub fn block_hash(&self) -> Hash32 {
        self.header.block_hash()
    }

    /// Merkle root computed over the block transactions.
    /// An odd node at any level is paired with itself.
    pub fn merkle_root(&self) -> Hash32 {
        let mut level: Vec<Hash32> = self.transactions.iter().map(MsgTx::tx_hash).collect();
        if level.is_empty() {
            return Hash32::default();
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let left = pair[0];
                    let right = pair.get(1).copied().unwrap_or(left);
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(left.as_bytes());
                    buf[32..].copy_from_slice(right.as_bytes());
                    Hash32::double_sha256(&buf)
                })
                .collect();
        }
        level[0]
    }

    pub fn is_merkle_root_valid(&self) -> bool {
        self.merkle_root() == self.header.merkle_root
    }

    pub fn serialize_size(&self) -> usize {
        BLOCK_HEADER_SIZE
            + var_int_size(self.transactions.len() as u64)
            + self
                .transactions
                .iter()
                .map(MsgTx::serialize_size)
                .sum::<usize>()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::wire::{
        header::tests::{create_genesis_header, GENESIS_MERKLE_ROOT},
        tx::tests::{create_coinbase_tx, create_spend_tx},
        OutPoint,
    };

    /// Block at `height` linked to `prev`. `seed` lets callers build
    /// competing blocks at the same height.
    pub fn create_block(prev: Hash32, height: u32, seed: u32) -> MsgBlock {
        let mut tx = create_coinbase_tx(height);
        tx.lock_time = seed;
        let mut block = MsgBlock::new(BlockHeader::new(1, prev, Hash32::default(), 0x1d00ffff, seed));
        block.header.timestamp = 1_500_000_000 + height * 600;
        block.add_transaction(tx);
        block.header.merkle_root = block.merkle_root();
        block
    }

    /// `count` blocks linked on top of `prev`, starting at height `from`.
    pub fn create_chain(prev: Hash32, from: u32, count: u32, seed: u32) -> Vec<MsgBlock> {
        let mut blocks = Vec::with_capacity(count as usize);
        let mut prev = prev;
        for height in from..from + count {
            let block = create_block(prev, height, seed);
            prev = block.block_hash();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn single_tx_merkle_root() {
        let mut block = MsgBlock::new(create_genesis_header());
        let tx = create_coinbase_tx(0);
        block.add_transaction(tx.clone());

        let root = block.merkle_root();

        assert_eq!(root, tx.tx_hash());
        assert_ne!(root.to_string(), GENESIS_MERKLE_ROOT);
    }

    #[test]
    fn odd_leaf_is_duplicated() {
        let mut block = MsgBlock::new(BlockHeader::default());
        let first = create_coinbase_tx(1);
        let outpoint = OutPoint::new(first.tx_hash(), 0);
        let second = create_spend_tx(outpoint, 1);
        let third = create_spend_tx(outpoint, 2);
        block.add_transaction(first.clone());
        block.add_transaction(second.clone());
        block.add_transaction(third.clone());

        let root = block.merkle_root();

        let pair = |a: Hash32, b: Hash32| {
            let mut buf = a.as_bytes().to_vec();
            buf.extend_from_slice(b.as_bytes());
            Hash32::double_sha256(&buf)
        };
        let left = pair(first.tx_hash(), second.tx_hash());
        let right = pair(third.tx_hash(), third.tx_hash());
        assert_eq!(root, pair(left, right));
    }

    #[test]
    fn invalid_merkle_root() {
        let mut block = create_block(Hash32::default(), 1, 0);

        block.header.merkle_root = Hash32::double_sha256(b"bogus");

        assert!(!block.is_merkle_root_valid());
    }

    #[test]
    fn chain_is_linked() {
        let blocks = create_chain(Hash32::default(), 1, 5, 0);

        for window in blocks.windows(2) {
            assert_eq!(window[1].header.prev_block, window[0].block_hash());
        }
        assert!(blocks.iter().all(MsgBlock::is_merkle_root_valid));
    }

    #[test]
    fn serialize_size_counts_transactions() {
        let block = create_block(Hash32::default(), 1, 0);

        let size = block.serialize_size();

        assert_eq!(size, BLOCK_HEADER_SIZE + 1 + block.transactions[0].serialize().len());
    }
}
