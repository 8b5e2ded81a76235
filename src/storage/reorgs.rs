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

//! Reorg log.
//!
//! The reorg being handled lives under the `active` key until the
//! consumer acknowledges it; cleared reorgs are archived under their id.

use super::Storage;
use crate::{
    base::serialize::{rmp_deserialize, rmp_serialize},
    crypto::Hash32,
    wire::BlockHeader,
    ErrorKind, Result,
};
use std::sync::Arc;

const REORGS_PREFIX: &str = "spynode/reorgs/";
const ACTIVE_KEY: &str = "spynode/reorgs/active";

/// Block removed by a reorg. The ids are the relevant confirmed txs only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgBlock {
    pub header: BlockHeader,
    pub txids: Vec<Hash32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reorg {
    /// Height of the last block both chains have in common.
    pub block_height: u32,
    /// Removed blocks, highest first.
    pub blocks: Vec<ReorgBlock>,
}

impl Reorg {
    pub fn new(block_height: u32) -> Self {
        Reorg {
            block_height,
            blocks: vec![],
        }
    }

    /// SHA-256 over the rollback height and the removed block hashes.
    pub fn id(&self) -> Hash32 {
        let mut data = self.block_height.to_le_bytes().to_vec();
        for block in &self.blocks {
            data.extend_from_slice(block.header.block_hash().as_bytes());
        }
        Hash32::sha256(&data)
    }
}

pub struct ReorgRepository {
    storage: Arc<dyn Storage>,
}

impl ReorgRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        ReorgRepository { storage }
    }

    /// Store `reorg` as the active one.
    pub fn save(&self, reorg: &Reorg) -> Result<()> {
        let buf = rmp_serialize(reorg)?;
        self.storage.write(ACTIVE_KEY, &buf)
    }

    pub fn active(&self) -> Result<Option<Reorg>> {
        match self.storage.read(ACTIVE_KEY) {
            Ok(buf) => rmp_deserialize(&buf).map(Some),
            Err(err) if err.kind == ErrorKind::ResourceNotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Archive the active reorg. Fails with `ResourceNotFound` if there is none.
    pub fn clear_active(&self) -> Result<()> {
        let buf = self.storage.read(ACTIVE_KEY)?;
        let active: Reorg = rmp_deserialize(&buf)?;
        let key = format!("{}{}", REORGS_PREFIX, hex::encode(active.id().as_bytes()));
        self.storage.write(&key, &buf)?;
        self.storage.remove(ACTIVE_KEY)?;
        info!(
            "[reorgs] cleared reorg at height {} ({} blocks)",
            active.block_height,
            active.blocks.len()
        );
        Ok(())
    }

    /// Archived reorgs.
    pub fn list(&self) -> Result<Vec<Reorg>> {
        self.storage
            .list(REORGS_PREFIX)?
            .iter()
            .filter(|key| key.as_str() != ACTIVE_KEY)
            .map(|key| {
                let buf = self.storage.read(key)?;
                rmp_deserialize(&buf)
            })
            .collect()
    }
}
