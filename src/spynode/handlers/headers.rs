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

//! Trusted headers handler.
//!
//! Headers are processed in message order. Each one either extends the
//! local tip, is a duplicate, forks the queue of pending block requests,
//! forks the committed chain or is an orphan. An orphan stops the batch:
//! the peer is expected to send a connected range later.
//!
//! Until the configured start block is seen, headers go straight into the
//! block repository and no block body is requested.

use crate::{
    base::{Mutex, RwLock},
    crypto::Hash32,
    spynode::{config::Config, requests::GetDataBatch, state::State, Shared},
    storage::{BlockRepository, Reorg, ReorgBlock, ReorgRepository, TxRepository},
    wire::{BlockHeader, InvType, Message, MsgHeaders},
    Error, ErrorKind, Result,
};
use std::sync::Arc;

/// Below this size every extending header is logged.
const VERBOSE_BATCH_SIZE: usize = 10;

pub struct HeadersHandler {
    config: Arc<Config>,
    state: Arc<Mutex<State>>,
    blocks: Arc<RwLock<BlockRepository>>,
    txs: Arc<RwLock<TxRepository>>,
    reorgs: Arc<Mutex<ReorgRepository>>,
}

/// The peer has nothing after our tip.
fn is_exhausted(msg: &MsgHeaders, last_hash: &Hash32) -> bool {
    match msg.headers.as_slice() {
        [] => true,
        [header] => header.block_hash() == *last_hash,
        _ => false,
    }
}

/// Queue the block request, adding it to `batch` if it has to be sent now.
/// A broken link only drops the request.
fn request_block(
    state: &mut State,
    batch: &mut GetDataBatch,
    header: &BlockHeader,
    hash: Hash32,
) -> Result<()> {
    match state.add_block_request(&header.prev_block, &hash) {
        Ok(true) => batch.add(InvType::Block, hash),
        Ok(false) => Ok(()),
        Err(err) if err.kind == ErrorKind::WrongPreviousHash => {
            warn!("[headers] block {} not requested: {}", hash, err.to_string_full());
            Ok(())
        }
        Err(err) => Err(err),
    }
}

impl HeadersHandler {
    pub fn new(shared: &Shared) -> Self {
        HeadersHandler {
            config: shared.config.clone(),
            state: shared.state.clone(),
            blocks: shared.blocks.clone(),
            txs: shared.txs.clone(),
            reorgs: shared.reorgs.clone(),
        }
    }

    pub fn handle(&self, msg: &MsgHeaders) -> Result<Vec<Message>> {
        let mut state = self.state.lock();
        let mut blocks = self.blocks.write();

        let mut last_hash = state.last_hash();
        if !state.is_ready() && is_exhausted(msg, &last_hash) {
            self.headers_exhausted(&mut state, &blocks)?;
            return Ok(vec![]);
        }

        let mut batch = GetDataBatch::new();
        let mut modified = false;
        let mut added = 0;
        let mut new_height = blocks.last_height() + state.total_block_request_count() as u32;

        for header in &msg.headers {
            let hash = header.block_hash();

            if header.prev_block == last_hash {
                if msg.headers.len() < VERBOSE_BATCH_SIZE {
                    debug!("[headers] adding header {}", hash);
                }
                if self.check_start_height(&mut state, &mut blocks, header, &hash)? {
                    request_block(&mut state, &mut batch, header, hash)?;
                }
                added += 1;
                new_height += 1;
                last_hash = hash;
                modified = true;
                continue;
            }

            if hash == last_hash {
                continue;
            }

            debug!(
                "[headers] header {} not next (previous {}, last {})",
                hash, header.prev_block, last_hash
            );

            if blocks.contains(&hash)
                || state.block_is_requested(&hash)
                || state.block_is_to_be_requested(&hash)
            {
                continue;
            }

            if state.block_is_requested(&header.prev_block)
                || state.block_is_to_be_requested(&header.prev_block)
            {
                info!("[headers] reorg in pending blocks after {}", header.prev_block);
                state.clear_block_requests_after(&header.prev_block);
                request_block(&mut state, &mut batch, header, hash)?;
                last_hash = hash;
                modified = true;
                added = 1;
                new_height = blocks.last_height() + state.total_block_request_count() as u32;
                continue;
            }

            if let Some(reorg_height) = blocks.height(&header.prev_block) {
                state.clear_in_sync();
                state.clear_block_requests();
                if reorg_height == blocks.last_height() {
                    info!("[headers] competing block at tip height {}", reorg_height);
                } else {
                    info!("[headers] reorging to height {}", reorg_height);
                    self.revert(&mut blocks, reorg_height, &header.prev_block)?;
                }
                state.set_last_hash(header.prev_block);

                if self.check_start_height(&mut state, &mut blocks, header, &hash)? {
                    request_block(&mut state, &mut batch, header, hash)?;
                }
                last_hash = hash;
                modified = true;
                added = 1;
                new_height = blocks.last_height() + state.total_block_request_count() as u32;
                continue;
            }

            debug!("[headers] orphan header {} (previous {})", hash, header.prev_block);
            return Ok(vec![]);
        }

        if modified {
            state.clear_headers_requested();
        }
        if added > 0 {
            info!("[headers] added {} headers to height {}", added, new_height);
        }
        Ok(batch.finish())
    }

    fn headers_exhausted(&self, state: &mut State, blocks: &BlockRepository) -> Result<()> {
        info!("[headers] headers in sync at height {}", blocks.last_height());
        state.set_pending_sync();
        if state.start_height().is_none() {
            warn!("[headers] headers in sync before the start block was found");
            state.set_in_sync();
        } else if state.block_requests_empty() {
            info!("[headers] blocks in sync at height {}", blocks.last_height());
            state.set_in_sync();
        }
        state.clear_headers_requested();
        blocks.save()
    }

    /// Returns true if the block body has to be requested.
    ///
    /// Before the start block is found the header is committed right away.
    fn check_start_height(
        &self,
        state: &mut State,
        blocks: &mut BlockRepository,
        header: &BlockHeader,
        hash: &Hash32,
    ) -> Result<bool> {
        if state.start_height().is_some() {
            return Ok(true);
        }

        if *hash == self.config.start_hash {
            let height = blocks.last_height() + 1;
            state.set_start_height(height);
            state.set_last_hash(header.prev_block);
            info!("[headers] found start block {} at height {}", hash, height);
            return Ok(true);
        }

        blocks.add(header)?;
        state.set_last_hash(*hash);
        Ok(false)
    }

    /// Roll the committed chain back to `height`, recording the removed
    /// blocks as the active reorg.
    fn revert(&self, blocks: &mut BlockRepository, height: u32, expected: &Hash32) -> Result<()> {
        let txs = self.txs.read();

        let mut reorg = Reorg::new(height);
        let mut removed_txs = Vec::new();
        for removed in (height + 1..=blocks.last_height()).rev() {
            let header = blocks.header(removed)?;
            let block_txs = txs.get_block(removed)?;
            reorg.blocks.push(ReorgBlock {
                header,
                txids: block_txs.txids().to_vec(),
            });
            removed_txs.push(block_txs);
        }

        blocks.revert(height)?;
        for block_txs in removed_txs {
            if block_txs.is_empty() {
                block_txs.release();
            } else {
                block_txs.remove()?;
            }
        }
        self.reorgs.lock().save(&reorg)?;
        info!("[headers] removed {} blocks", reorg.blocks.len());

        let last_hash = blocks.last_hash();
        if last_hash != *expected {
            error!(
                "[headers] revert to height {} left tip {} instead of {}",
                height, last_hash, expected
            );
            return Err(Error::new_ext(
                ErrorKind::InconsistentState,
                format!("revert produced tip {} instead of {}", last_hash, expected),
            ));
        }
        Ok(())
    }
}
