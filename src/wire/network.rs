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

use super::BlockHeader;
use crate::{crypto::Hash32, Error, ErrorKind, Result};
use std::{fmt, str::FromStr};

/// Merkle root shared by the main and test network genesis blocks.
const GENESIS_MERKLE_ROOT: [u8; 32] = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    MainNet,
    TestNet,
}

impl Default for Network {
    fn default() -> Self {
        Network::MainNet
    }
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::MainNet => "mainnet",
            Network::TestNet => "testnet",
        }
    }

    /// First header of the network chain.
    pub fn genesis_header(&self) -> BlockHeader {
        let (timestamp, nonce) = match self {
            Network::MainNet => (1231006505, 2083236893),
            Network::TestNet => (1296688602, 414098458),
        };
        BlockHeader {
            version: 1,
            prev_block: Hash32::default(),
            merkle_root: Hash32::new(GENESIS_MERKLE_ROOT),
            timestamp,
            bits: 0x1d00ffff,
            nonce,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mainnet" => Ok(Network::MainNet),
            "testnet" => Ok(Network::TestNet),
            _ => Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("unknown network `{}`", s),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::header::tests::{create_genesis_header, MAINNET_GENESIS_HASH};

    const TESTNET_GENESIS_HASH: &str =
        "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943";

    #[test]
    fn mainnet_genesis() {
        let header = Network::MainNet.genesis_header();

        assert_eq!(header, create_genesis_header());
        assert_eq!(header.block_hash().to_string(), MAINNET_GENESIS_HASH);
    }

    #[test]
    fn testnet_genesis() {
        let header = Network::TestNet.genesis_header();

        assert_eq!(header.block_hash().to_string(), TESTNET_GENESIS_HASH);
    }

    #[test]
    fn parse_network() {
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::TestNet);
        assert!("regtest".parse::<Network>().is_err());
    }
}
