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
    spynode::{state::State, untrusted_state::UntrustedState, Shared},
    wire::{Message, MsgVersion},
    Result,
};
use std::sync::Arc;

/// Records the peer version and acknowledges it.
pub struct VersionHandler {
    state: Arc<Mutex<State>>,
}

impl VersionHandler {
    pub fn new(shared: &Shared) -> Self {
        VersionHandler {
            state: shared.state.clone(),
        }
    }

    pub fn handle(&self, msg: &MsgVersion) -> Result<Vec<Message>> {
        debug!(
            "[node] peer version {} ({}) at height {}",
            msg.protocol_version, msg.user_agent, msg.last_block
        );
        self.state.lock().set_version_received(msg.protocol_version);
        Ok(vec![Message::VerAck])
    }
}

pub struct UntrustedVersionHandler;

impl UntrustedVersionHandler {
    pub fn handle(&self, state: &mut UntrustedState, msg: &MsgVersion) -> Result<Vec<Message>> {
        state.set_version_received(msg.protocol_version);
        Ok(vec![Message::VerAck])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::Hash32, spynode::tests::create_shared};

    #[test]
    fn version_is_acknowledged() {
        let (_, shared) = create_shared(Hash32::default());
        let handler = VersionHandler::new(&shared);
        let msg = MsgVersion {
            protocol_version: 70001,
            ..Default::default()
        };

        let messages = handler.handle(&msg).unwrap();

        assert_eq!(messages, vec![Message::VerAck]);
        let state = shared.state.lock();
        assert!(state.version_received());
        assert_eq!(state.protocol_version(), 70001);
    }

    #[test]
    fn untrusted_version_is_acknowledged() {
        let mut state = UntrustedState::new();

        let messages = UntrustedVersionHandler
            .handle(&mut state, &MsgVersion::default())
            .unwrap();

        assert_eq!(messages, vec![Message::VerAck]);
        assert!(state.version_received());
    }
}
