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

//! Re-delivery of already processed blocks.
//!
//! The refeeder walks the committed chain one block at a time from an armed
//! height up to the tip, independently from the main request queue. It has
//! its own lock so that a refeed never waits on the chain state.

use crate::{base::Mutex, crypto::Hash32, wire::MsgBlock};

#[derive(Default)]
struct Inner {
    /// Armed height and hash, `None` while inactive.
    next: Option<(u32, Hash32)>,
    requested: bool,
    block: Option<MsgBlock>,
}

impl Inner {
    fn arm(&mut self, height: u32, hash: Hash32) {
        self.next = Some((height, hash));
        self.requested = false;
        self.block = None;
    }
}

#[derive(Default)]
pub struct BlockRefeeder {
    inner: Mutex<Inner>,
}

impl BlockRefeeder {
    pub fn new() -> Self {
        BlockRefeeder::default()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().next.is_some()
    }

    pub fn next_height(&self) -> Option<u32> {
        self.inner.lock().next.map(|(height, _)| height)
    }

    pub fn is_next_block(&self, hash: &Hash32) -> bool {
        matches!(self.inner.lock().next, Some((_, next)) if next == *hash)
    }

    /// Deliver a block. Only the armed block is accepted.
    pub fn set_block(&self, hash: &Hash32, block: MsgBlock) -> bool {
        let mut inner = self.inner.lock();
        match inner.next {
            Some((_, next)) if next == *hash => {
                inner.block = Some(block);
                true
            }
            _ => false,
        }
    }

    /// Take the delivered block with its height.
    pub fn take_block(&self) -> Option<(MsgBlock, u32)> {
        let mut inner = self.inner.lock();
        let (height, _) = inner.next?;
        inner.block.take().map(|block| (block, height))
    }

    /// Hash to request. Returned once per armed block.
    pub fn block_to_request(&self) -> Option<Hash32> {
        let mut inner = self.inner.lock();
        let (_, hash) = inner.next?;
        if inner.requested {
            return None;
        }
        inner.requested = true;
        Some(hash)
    }

    /// Arm at `height`, unless already armed at a lower height.
    pub fn set_height(&self, height: u32, hash: Hash32) {
        let mut inner = self.inner.lock();
        match inner.next {
            Some((next, _)) if next <= height => (),
            _ => {
                debug!("[refeeder] refeeding from height {}", height);
                inner.arm(height, hash);
            }
        }
    }

    /// Move on to `height`, which must follow the armed one.
    pub fn increment(&self, height: u32, hash: Hash32) {
        let mut inner = self.inner.lock();
        if matches!(inner.next, Some((next, _)) if next + 1 == height) {
            inner.arm(height, hash);
        }
    }

    /// Disarm if `height` is the armed one.
    pub fn clear(&self, height: u32) {
        let mut inner = self.inner.lock();
        if matches!(inner.next, Some((next, _)) if next == height) {
            debug!("[refeeder] caught up at height {}", height);
            inner.next = None;
            inner.requested = true;
            inner.block = None;
        }
    }
}
