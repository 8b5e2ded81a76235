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

//! P2P message handlers.
//!
//! A handler consumes one decoded message and returns the replies to send
//! back on the same connection. Each connection type gets its own
//! dispatcher, matching every [Message] variant to exactly one handler.

mod address;
mod block;
mod headers;
mod inventory;
mod ping;
mod reject;
mod transaction;
mod untrusted_headers;
mod version;

pub use address::AddressHandler;
pub use block::BlockHandler;
pub use headers::HeadersHandler;
pub use inventory::{InvHandler, UntrustedInvHandler};
pub use ping::PingHandler;
pub use reject::RejectHandler;
pub use transaction::{TxHandler, UntrustedTxHandler};
pub use untrusted_headers::UntrustedHeadersHandler;
pub use version::{UntrustedVersionHandler, VersionHandler};

use super::{tracker::TxTracker, untrusted_state::UntrustedState, Shared};
use crate::{wire::Message, Result};
use std::sync::Arc;

/// Handlers of the trusted connection.
pub struct Dispatcher {
    version: VersionHandler,
    address: AddressHandler,
    inv: InvHandler,
    tx: TxHandler,
    block: BlockHandler,
    headers: HeadersHandler,
}

impl Dispatcher {
    pub fn new(shared: &Shared, tracker: Arc<TxTracker>) -> Self {
        Dispatcher {
            version: VersionHandler::new(shared),
            address: AddressHandler::new(shared),
            inv: InvHandler::new(shared, tracker),
            tx: TxHandler::new(shared),
            block: BlockHandler::new(shared),
            headers: HeadersHandler::new(shared),
        }
    }

    pub fn dispatch(&self, msg: Message) -> Result<Vec<Message>> {
        let command = msg.command();
        match msg {
            Message::Ping(ping) => PingHandler.handle(&ping),
            Message::Version(version) => self.version.handle(&version),
            Message::Addr(addr) => self.address.handle(&addr),
            Message::Inv(inv) => self.inv.handle(&inv),
            Message::Tx(tx) => self.tx.handle(tx),
            Message::Block(block) => self.block.handle(*block),
            Message::Headers(headers) => self.headers.handle(&headers),
            Message::Reject(reject) => RejectHandler.handle(&reject),
            Message::VerAck
            | Message::Pong(_)
            | Message::GetAddr
            | Message::GetData(_)
            | Message::GetHeaders(_)
            | Message::SendHeaders
            | Message::MemPool => {
                trace!("[node] ignoring {}", command);
                Ok(vec![])
            }
        }
    }
}

/// Handlers of an untrusted connection.
pub struct UntrustedDispatcher {
    address: AddressHandler,
    inv: UntrustedInvHandler,
    tx: UntrustedTxHandler,
    headers: UntrustedHeadersHandler,
}

impl UntrustedDispatcher {
    pub fn new(address: &str, shared: &Shared, tracker: Arc<TxTracker>) -> Self {
        UntrustedDispatcher {
            address: AddressHandler::new(shared),
            inv: UntrustedInvHandler::new(shared, tracker),
            tx: UntrustedTxHandler::new(shared),
            headers: UntrustedHeadersHandler::new(address, shared),
        }
    }

    /// Untrusted blocks are never used, the chain comes from the trusted peer only.
    pub fn dispatch(&self, state: &mut UntrustedState, msg: Message) -> Result<Vec<Message>> {
        let command = msg.command();
        match msg {
            Message::Ping(ping) => PingHandler.handle(&ping),
            Message::Version(version) => UntrustedVersionHandler.handle(state, &version),
            Message::Addr(addr) => self.address.handle(&addr),
            Message::Inv(inv) => self.inv.handle(state, &inv),
            Message::Tx(tx) => self.tx.handle(state, tx),
            Message::Headers(headers) => self.headers.handle(state, &headers),
            Message::Reject(reject) => RejectHandler.handle(&reject),
            Message::Block(_)
            | Message::VerAck
            | Message::Pong(_)
            | Message::GetAddr
            | Message::GetData(_)
            | Message::GetHeaders(_)
            | Message::SendHeaders
            | Message::MemPool => {
                trace!("[untrusted] ignoring {}", command);
                Ok(vec![])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::Hash32,
        spynode::tests::create_shared,
        wire::{block::tests::create_chain, MsgPing, MsgPong},
    };

    #[test]
    fn ping_is_answered() {
        let (_, shared) = create_shared(Hash32::default());
        let dispatcher = Dispatcher::new(&shared, shared.register_tracker());

        let messages = dispatcher.dispatch(Message::Ping(MsgPing { nonce: 3 })).unwrap();

        assert_eq!(messages, vec![Message::Pong(MsgPong { nonce: 3 })]);
    }

    #[test]
    fn requests_are_ignored() {
        let (_, shared) = create_shared(Hash32::default());
        let dispatcher = Dispatcher::new(&shared, shared.register_tracker());

        let messages = dispatcher.dispatch(Message::GetAddr).unwrap();

        assert!(messages.is_empty());
    }

    #[test]
    fn untrusted_blocks_are_ignored() {
        let (_, shared) = create_shared(Hash32::default());
        let block = create_chain(Hash32::default(), 1, 1, 0).remove(0);
        shared
            .state
            .lock()
            .add_block_request(&Hash32::default(), &block.block_hash())
            .unwrap();
        let tracker = shared.register_tracker();
        let dispatcher = UntrustedDispatcher::new("10.0.0.1:8333", &shared, tracker);
        let mut state = UntrustedState::new();

        dispatcher
            .dispatch(&mut state, Message::Block(Box::new(block)))
            .unwrap();

        assert!(shared.state.lock().next_block().is_none());
    }
}
