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

//! Untrusted connection state. Owned by its connection, never shared.

use crate::{wire::PROTOCOL_VERSION, Error, ErrorKind, Result};

/// Max time to wait for the verification headers (ms).
const HEADERS_REQUEST_TIMEOUT: u64 = 60_000;

bitflags::bitflags! {
    struct Flags: u8 {
        const VERSION_RECEIVED = 1 << 0;
        const HANDSHAKE_COMPLETE = 1 << 1;
        const ADDRESSES_REQUESTED = 1 << 2;
        const MEMPOOL_REQUESTED = 1 << 3;
        /// Headers link to the local chain.
        const VERIFIED = 1 << 4;
        const SCORE_UPDATED = 1 << 5;
    }
}

pub struct UntrustedState {
    flags: Flags,
    protocol_version: u32,
    connected_time: Option<u64>,
    headers_requested: Option<u64>,
}

impl Default for UntrustedState {
    fn default() -> Self {
        UntrustedState {
            flags: Flags::empty(),
            protocol_version: PROTOCOL_VERSION,
            connected_time: None,
            headers_requested: None,
        }
    }
}

impl UntrustedState {
    pub fn new() -> Self {
        UntrustedState::default()
    }

    /// Ready once the handshake is done and the peer headers were verified.
    pub fn is_ready(&self) -> bool {
        self.flags
            .contains(Flags::VERSION_RECEIVED | Flags::VERIFIED)
    }

    pub fn set_verified(&mut self) {
        self.flags.insert(Flags::VERIFIED);
    }

    pub fn score_updated(&self) -> bool {
        self.flags.contains(Flags::SCORE_UPDATED)
    }

    pub fn set_score_updated(&mut self) {
        self.flags.insert(Flags::SCORE_UPDATED);
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn mark_connected(&mut self, now: u64) {
        self.connected_time = Some(now);
    }

    pub fn connected_time(&self) -> Option<u64> {
        self.connected_time
    }

    pub fn version_received(&self) -> bool {
        self.flags.contains(Flags::VERSION_RECEIVED)
    }

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

    pub fn headers_requested(&self) -> Option<u64> {
        self.headers_requested
    }

    pub fn mark_headers_requested(&mut self, now: u64) {
        self.headers_requested = Some(now);
    }

    pub fn clear_headers_requested(&mut self) {
        self.headers_requested = None;
    }

    pub fn check_timeouts(&self, now: u64) -> Result<()> {
        match self.headers_requested {
            Some(time) if now.saturating_sub(time) > HEADERS_REQUEST_TIMEOUT => Err(Error::new_ext(
                ErrorKind::RequestTimeout,
                format!("verification headers requested {} ms ago", now - time),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_after_verification() {
        let mut state = UntrustedState::new();
        state.set_version_received(PROTOCOL_VERSION);
        state.set_handshake_complete();
        assert!(!state.is_ready());

        state.set_verified();

        assert!(state.is_ready());
        assert!(!state.score_updated());
    }

    #[test]
    fn verified_without_version_is_not_ready() {
        let mut state = UntrustedState::new();

        state.set_verified();

        assert!(!state.is_ready());
    }

    #[test]
    fn headers_timeout() {
        let mut state = UntrustedState::new();
        state.mark_headers_requested(1_000);

        assert!(state.check_timeouts(1_000 + HEADERS_REQUEST_TIMEOUT).is_ok());
        let err = state
            .check_timeouts(1_001 + HEADERS_REQUEST_TIMEOUT)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RequestTimeout);
    }
}
