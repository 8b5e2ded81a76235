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

//! Node configuration.

use crate::{crypto::Hash32, wire::Network, Result};
use std::fmt;

/// Connection attempts before giving up on the trusted node.
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Delay between connection attempts (ms).
pub const DEFAULT_RETRY_DELAY: u64 = 5000;

/// Delay before a relevant unconfirmed tx is reported safe (ms).
pub const DEFAULT_SAFE_TX_DELAY: u64 = 2000;

const DEFAULT_USER_AGENT: &str = "/spynode:0.1.0/";

/// Spynode configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bitcoin network.
    pub net: Network,
    /// Trusted full node `ip:port`.
    pub node_address: String,
    /// User agent sent in the version message.
    pub user_agent: String,
    /// First block whose body is downloaded.
    pub start_hash: Hash32,
    /// Number of untrusted peers to keep connected.
    pub untrusted_count: usize,
    /// Delay before an unconfirmed tx without conflicts is safe (ms).
    pub safe_tx_delay: u64,
    /// Number of peers each outgoing tx is sent to.
    pub shotgun_count: usize,
    /// Ask the trusted node for its mempool once in sync.
    pub request_mempool: bool,
    /// Reconnection attempts.
    pub max_retries: u32,
    /// Delay between reconnection attempts (ms).
    pub retry_delay: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            net: Network::MainNet,
            node_address: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            start_hash: Hash32::default(),
            untrusted_count: 0,
            safe_tx_delay: DEFAULT_SAFE_TX_DELAY,
            shotgun_count: 0,
            request_mempool: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl Config {
    /// Build a configuration, `start_hash` is given in display (reversed hex) order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        net: Network,
        node_address: &str,
        user_agent: &str,
        start_hash: &str,
        untrusted_count: usize,
        safe_tx_delay: u64,
        shotgun_count: usize,
        request_mempool: bool,
    ) -> Result<Self> {
        let start_hash = start_hash.parse::<Hash32>()?;
        Ok(Config {
            net,
            node_address: node_address.to_owned(),
            user_agent: user_agent.to_owned(),
            start_hash,
            untrusted_count,
            safe_tx_delay,
            shotgun_count,
            request_mempool,
            ..Default::default()
        })
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "net: {}, node: {}, user agent: {}, start hash: {}, untrusted: {}, safe delay: {}ms",
            self.net,
            self.node_address,
            self.user_agent,
            self.start_hash,
            self.untrusted_count,
            self.safe_tx_delay
        )
    }
}
