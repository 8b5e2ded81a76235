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
    base::Mutex,
    spynode::{refeeder::BlockRefeeder, state::State, Shared},
    wire::{Message, MsgBlock},
    Result,
};
use std::sync::Arc;

/// Routes received block bodies to whoever asked for them.
pub struct BlockHandler {
    state: Arc<Mutex<State>>,
    refeeder: Arc<BlockRefeeder>,
}

impl BlockHandler {
    pub fn new(shared: &Shared) -> Self {
        BlockHandler {
            state: shared.state.clone(),
            refeeder: shared.refeeder.clone(),
        }
    }

    pub fn handle(&self, block: MsgBlock) -> Result<Vec<Message>> {
        let hash = block.block_hash();
        if self.refeeder.is_next_block(&hash) {
            debug!("[blocks] refeed block {} received", hash);
            self.refeeder.set_block(&hash, block);
        } else if !self.state.lock().add_block(&hash, block) {
            debug!("[blocks] dropping block {}, not requested", hash);
        }
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::Hash32, spynode::tests::create_shared, wire::block::tests::create_chain,
    };

    #[test]
    fn requested_block_is_attached() {
        let (_, shared) = create_shared(Hash32::default());
        let blocks = create_chain(Hash32::default(), 1, 1, 0);
        let hash = blocks[0].block_hash();
        shared
            .state
            .lock()
            .add_block_request(&Hash32::default(), &hash)
            .unwrap();
        let handler = BlockHandler::new(&shared);

        handler.handle(blocks[0].clone()).unwrap();

        assert_eq!(shared.state.lock().next_block(), Some(blocks[0].clone()));
    }

    #[test]
    fn refeed_block_goes_to_refeeder() {
        let (_, shared) = create_shared(Hash32::default());
        let blocks = create_chain(Hash32::default(), 1, 1, 0);
        shared.refeeder.set_height(1, blocks[0].block_hash());
        let handler = BlockHandler::new(&shared);

        handler.handle(blocks[0].clone()).unwrap();

        assert_eq!(shared.refeeder.take_block(), Some((blocks[0].clone(), 1)));
        assert!(shared.state.lock().next_block().is_none());
    }

    #[test]
    fn unrequested_block_is_dropped() {
        let (_, shared) = create_shared(Hash32::default());
        let blocks = create_chain(Hash32::default(), 1, 1, 0);
        let handler = BlockHandler::new(&shared);

        let messages = handler.handle(blocks[0].clone()).unwrap();

        assert!(messages.is_empty());
        assert!(shared.state.lock().next_block().is_none());
    }
}
