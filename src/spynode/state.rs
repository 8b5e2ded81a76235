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

//! Trusted connection state.
//!
//! Besides the handshake and sync flags this holds the block request queue:
//! headers accepted by the headers handler whose bodies were not processed
//! yet. The queue is split in two contiguous parts, the blocks already asked
//! to the peer (bounded by count and by the size of the bodies waiting to be
//! processed) followed by the blocks still to be asked.

use super::{MAX_PENDING_BLOCK_SIZE, MAX_REQUESTED_BLOCKS};
use crate::{
    base::timestamp_millis,
    crypto::Hash32,
    wire::{MsgBlock, PROTOCOL_VERSION},
    Error, ErrorKind, Result,
};
use std::collections::VecDeque;

/// Max time to wait for a headers reply (ms).
const HEADERS_REQUEST_TIMEOUT: u64 = 60_000;

/// Max time to wait for the oldest requested block (ms).
const BLOCK_REQUEST_TIMEOUT: u64 = 180_000;

bitflags::bitflags! {
    /// Connection and sync progress flags.
    struct Flags: u16 {
        const VERSION_RECEIVED = 1 << 0;
        const HANDSHAKE_COMPLETE = 1 << 1;
        const SENT_SEND_HEADERS = 1 << 2;
        const ADDRESSES_REQUESTED = 1 << 3;
        const MEMPOOL_REQUESTED = 1 << 4;
        const WAS_IN_SYNC = 1 << 5;
        const IN_SYNC = 1 << 6;
        /// Listener already told about the sync.
        const NOTIFIED_SYNC = 1 << 7;
        /// The peer has no more headers, only the queued blocks are missing.
        const PENDING_SYNC = 1 << 8;
        /// Dropped on reconnection.
        const CONNECTION = Self::VERSION_RECEIVED.bits
            | Self::HANDSHAKE_COMPLETE.bits
            | Self::SENT_SEND_HEADERS.bits
            | Self::MEMPOOL_REQUESTED.bits
            | Self::WAS_IN_SYNC.bits
            | Self::IN_SYNC.bits
            | Self::PENDING_SYNC.bits;
    }
}

struct RequestedBlock {
    hash: Hash32,
    /// Request time (ms).
    time: u64,
    block: Option<MsgBlock>,
}

pub struct State {
    flags: Flags,
    protocol_version: u32,
    /// Connection time (ms).
    connected_time: Option<u64>,
    /// Last headers request time (ms).
    headers_requested: Option<u64>,
    /// Height of the first block whose body is downloaded.
    start_height: Option<u32>,
    blocks_requested: VecDeque<RequestedBlock>,
    blocks_to_request: VecDeque<Hash32>,
    /// Bytes of received bodies waiting to be processed.
    pending_size: usize,
    /// Last block handed out for processing.
    last_saved_hash: Hash32,
}

impl Default for State {
    fn default() -> Self {
        State {
            flags: Flags::empty(),
            protocol_version: PROTOCOL_VERSION,
            connected_time: None,
            headers_requested: None,
            start_height: None,
            blocks_requested: VecDeque::with_capacity(MAX_REQUESTED_BLOCKS),
            blocks_to_request: VecDeque::new(),
            pending_size: 0,
            last_saved_hash: Hash32::default(),
        }
    }
}

fn wrong_previous(prev: &Hash32, last: &Hash32) -> Error {
    Error::new_ext(
        ErrorKind::WrongPreviousHash,
        format!("request previous {} does not match last {}", prev, last),
    )
}

impl State {
    pub fn new() -> Self {
        State::default()
    }

    /// Forget the connection. Sync progress and the start height are kept.
    pub fn reset(&mut self) {
        self.flags.remove(Flags::CONNECTION);
        self.protocol_version = PROTOCOL_VERSION;
        self.connected_time = None;
        self.headers_requested = None;
        self.blocks_requested.clear();
        self.blocks_to_request.clear();
        self.pending_size = 0;
    }

    pub fn mark_connected(&mut self, now: u64) {
        self.connected_time = Some(now);
    }

    pub fn connected_time(&self) -> Option<u64> {
        self.connected_time
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn version_received(&self) -> bool {
        self.flags.contains(Flags::VERSION_RECEIVED)
    }

    /// Record the peer version. The lower protocol version wins.
    pub fn set_version_received(&mut self, protocol_version: u32) {
        self.flags.insert(Flags::VERSION_RECEIVED);
        self.protocol_version = self.protocol_version.min(protocol_version);
    }

    pub fn handshake_complete(&self) -> bool {
        self.flags.contains(Flags::HANDSHAKE_COMPLETE)
    }

    pub fn set_handshake_complete(&mut self) {
        self.flags.insert(Flags::HANDSHAKE_COMPLETE);
    }

    pub fn sent_send_headers(&self) -> bool {
        self.flags.contains(Flags::SENT_SEND_HEADERS)
    }

    pub fn set_sent_send_headers(&mut self) {
        self.flags.insert(Flags::SENT_SEND_HEADERS);
    }

    pub fn addresses_requested(&self) -> bool {
        self.flags.contains(Flags::ADDRESSES_REQUESTED)
    }

    pub fn set_addresses_requested(&mut self) {
        self.flags.insert(Flags::ADDRESSES_REQUESTED);
    }

    pub fn mempool_requested(&self) -> bool {
        self.flags.contains(Flags::MEMPOOL_REQUESTED)
    }

    pub fn set_mempool_requested(&mut self) {
        self.flags.insert(Flags::MEMPOOL_REQUESTED);
    }

    pub fn is_pending_sync(&self) -> bool {
        self.flags.contains(Flags::PENDING_SYNC)
    }

    pub fn set_pending_sync(&mut self) {
        self.flags.insert(Flags::PENDING_SYNC);
    }

    /// In sync with the trusted node.
    pub fn is_ready(&self) -> bool {
        self.flags.contains(Flags::IN_SYNC)
    }

    pub fn set_in_sync(&mut self) {
        if !self.is_ready() {
            info!("[state] in sync");
        }
        self.flags.insert(Flags::IN_SYNC);
    }

    pub fn clear_in_sync(&mut self) {
        self.flags.remove(Flags::IN_SYNC | Flags::WAS_IN_SYNC);
    }

    pub fn was_in_sync(&self) -> bool {
        self.flags.contains(Flags::WAS_IN_SYNC)
    }

    pub fn set_was_in_sync(&mut self) {
        self.flags.insert(Flags::WAS_IN_SYNC);
    }

    pub fn notified_sync(&self) -> bool {
        self.flags.contains(Flags::NOTIFIED_SYNC)
    }

    pub fn set_notified_sync(&mut self) {
        self.flags.insert(Flags::NOTIFIED_SYNC);
    }

    pub fn start_height(&self) -> Option<u32> {
        self.start_height
    }

    pub fn set_start_height(&mut self, height: u32) {
        self.start_height = Some(height);
    }

    pub fn headers_requested(&self) -> Option<u64> {
        self.headers_requested
    }

    pub fn mark_headers_requested(&mut self, now: u64) {
        self.headers_requested = Some(now);
    }

    pub fn clear_headers_requested(&mut self) {
        self.headers_requested = None;
    }

    /// Queue the block `hash` linked to `prev`.
    ///
    /// Returns true if the block has to be requested right away, false if it
    /// was queued for later or it is already in the queue. A `prev` that is
    /// not the tail of the queue fails with `WrongPreviousHash`.
    pub fn add_block_request(&mut self, prev: &Hash32, hash: &Hash32) -> Result<bool> {
        if self.block_is_requested(hash) || self.block_is_to_be_requested(hash) {
            return Ok(false);
        }

        if let Some(last) = self.blocks_to_request.back() {
            if last != prev {
                return Err(wrong_previous(prev, last));
            }
            self.blocks_to_request.push_back(*hash);
            return Ok(false);
        }

        let last = self
            .blocks_requested
            .back()
            .map(|request| request.hash)
            .unwrap_or(self.last_saved_hash);
        if last != *prev {
            return Err(wrong_previous(prev, &last));
        }

        if self.is_request_limit_reached() {
            self.blocks_to_request.push_back(*hash);
            return Ok(false);
        }

        self.blocks_requested.push_back(RequestedBlock {
            hash: *hash,
            time: timestamp_millis(),
            block: None,
        });
        Ok(true)
    }

    fn is_request_limit_reached(&self) -> bool {
        self.blocks_requested.len() >= MAX_REQUESTED_BLOCKS
            || self.pending_size > MAX_PENDING_BLOCK_SIZE
    }

    /// Attach a received body to its request.
    /// Returns false if the block was not requested or already received.
    pub fn add_block(&mut self, hash: &Hash32, block: MsgBlock) -> bool {
        match self
            .blocks_requested
            .iter_mut()
            .find(|request| request.hash == *hash)
        {
            Some(request) if request.block.is_none() => {
                self.pending_size += block.serialize_size();
                request.block = Some(block);
                true
            }
            _ => false,
        }
    }

    /// Pop the oldest request if its body was received.
    pub fn next_block(&mut self) -> Option<MsgBlock> {
        if !matches!(self.blocks_requested.front(), Some(request) if request.block.is_some()) {
            return None;
        }
        let request = self.blocks_requested.pop_front()?;
        let block = request.block?;
        self.pending_size = self.pending_size.saturating_sub(block.serialize_size());
        self.last_saved_hash = request.hash;
        Some(block)
    }

    /// Move the first queued block to the requested ones, if the limits allow it.
    pub fn next_block_to_request(&mut self) -> Option<Hash32> {
        if self.blocks_to_request.is_empty() || self.is_request_limit_reached() {
            return None;
        }
        let hash = self.blocks_to_request.pop_front()?;
        self.blocks_requested.push_back(RequestedBlock {
            hash,
            time: timestamp_millis(),
            block: None,
        });
        Some(hash)
    }

    pub fn block_is_requested(&self, hash: &Hash32) -> bool {
        self.blocks_requested.iter().any(|request| request.hash == *hash)
    }

    pub fn block_is_to_be_requested(&self, hash: &Hash32) -> bool {
        self.blocks_to_request.contains(hash)
    }

    pub fn total_block_request_count(&self) -> usize {
        self.blocks_requested.len() + self.blocks_to_request.len()
    }

    pub fn block_requests_empty(&self) -> bool {
        self.blocks_requested.is_empty() && self.blocks_to_request.is_empty()
    }

    pub fn clear_block_requests(&mut self) {
        self.blocks_requested.clear();
        self.blocks_to_request.clear();
        self.pending_size = 0;
    }

    /// Drop every request after `hash`. Returns false if `hash` is not in the queue.
    pub fn clear_block_requests_after(&mut self, hash: &Hash32) -> bool {
        if let Some(index) = self
            .blocks_requested
            .iter()
            .position(|request| request.hash == *hash)
        {
            let removed = self.blocks_requested.split_off(index + 1);
            let removed_size: usize = removed
                .iter()
                .filter_map(|request| request.block.as_ref())
                .map(MsgBlock::serialize_size)
                .sum();
            self.pending_size = self.pending_size.saturating_sub(removed_size);
            info!(
                "[state] removing {} requested and {} queued blocks after {}",
                removed.len(),
                self.blocks_to_request.len(),
                hash
            );
            self.blocks_to_request.clear();
            return true;
        }

        if let Some(index) = self.blocks_to_request.iter().position(|h| h == hash) {
            info!(
                "[state] removing {} queued blocks after {}",
                self.blocks_to_request.len() - index - 1,
                hash
            );
            self.blocks_to_request.truncate(index + 1);
            return true;
        }
        false
    }

    /// Hash `delta` entries back from the tail of the queue.
    pub fn block_request_hash(&self, delta: usize) -> Option<Hash32> {
        if self.blocks_to_request.len() > delta {
            return self
                .blocks_to_request
                .get(self.blocks_to_request.len() - delta - 1)
                .copied();
        }
        if self.blocks_requested.len() > delta {
            return self
                .blocks_requested
                .get(self.blocks_requested.len() - delta - 1)
                .map(|request| request.hash);
        }
        None
    }

    /// Tail of the queue, or the last block handed out when it is empty.
    pub fn last_hash(&self) -> Hash32 {
        if let Some(hash) = self.blocks_to_request.back() {
            return *hash;
        }
        if let Some(request) = self.blocks_requested.back() {
            return request.hash;
        }
        self.last_saved_hash
    }

    pub fn set_last_hash(&mut self, hash: Hash32) {
        self.last_saved_hash = hash;
    }

    /// Fails with `RequestTimeout` when the peer is not answering.
    pub fn check_timeouts(&self, now: u64) -> Result<()> {
        if let Some(time) = self.headers_requested {
            if now.saturating_sub(time) > HEADERS_REQUEST_TIMEOUT {
                return Err(Error::new_ext(
                    ErrorKind::RequestTimeout,
                    format!("headers requested {} ms ago", now - time),
                ));
            }
        }
        if let Some(request) = self.blocks_requested.front() {
            if request.block.is_none() && now.saturating_sub(request.time) > BLOCK_REQUEST_TIMEOUT {
                return Err(Error::new_ext(
                    ErrorKind::RequestTimeout,
                    format!("block {} requested {} ms ago", request.hash, now - request.time),
                ));
            }
        }
        Ok(())
    }
}
