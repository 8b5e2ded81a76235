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

//! Known peer addresses with their reputation.

use super::Storage;
use crate::{
    base::{
        serialize::{rmp_deserialize, rmp_serialize},
        timestamp_secs,
    },
    ErrorKind, Result,
};
use std::{collections::HashMap, sync::Arc};

const PEERS_KEY: &str = "spynode/peers";

/// Peers not touched for this long with a zero score are worth a check.
const UNCHECKED_PERIOD: u32 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// `ip:port`
    pub address: String,
    pub score: i32,
    /// Last score update (unix seconds).
    pub last_time: u32,
}

pub struct PeerRepository {
    storage: Arc<dyn Storage>,
    list: Vec<Peer>,
    lookup: HashMap<String, usize>,
}

impl PeerRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        PeerRepository {
            storage,
            list: vec![],
            lookup: HashMap::new(),
        }
    }

    pub fn load(&mut self) -> Result<()> {
        self.list.clear();
        self.lookup.clear();
        let buf = match self.storage.read(PEERS_KEY) {
            Ok(buf) => buf,
            Err(err) if err.kind == ErrorKind::ResourceNotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        let peers: Vec<Peer> = rmp_deserialize(&buf)?;
        for peer in peers {
            self.insert(peer);
        }
        debug!("[peers] loaded {} peers", self.list.len());
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        debug!("[peers] saving {} peers", self.list.len());
        let buf = rmp_serialize(&self.list)?;
        self.storage.write(PEERS_KEY, &buf)
    }

    fn insert(&mut self, peer: Peer) {
        self.lookup.insert(peer.address.clone(), self.list.len());
        self.list.push(peer);
    }

    pub fn count(&self) -> usize {
        self.list.len()
    }

    /// Returns true if the address was not already known.
    pub fn add(&mut self, address: &str) -> bool {
        if self.lookup.contains_key(address) {
            return false;
        }
        self.insert(Peer {
            address: address.to_owned(),
            score: 0,
            last_time: 0,
        });
        true
    }

    /// Peers at or above `min_score`.
    pub fn get(&self, min_score: i32) -> Vec<Peer> {
        self.list
            .iter()
            .filter(|peer| peer.score >= min_score)
            .cloned()
            .collect()
    }

    /// Zero score peers not updated in the last 24 hours.
    pub fn unchecked(&self) -> Vec<Peer> {
        let cutoff = timestamp_secs().saturating_sub(UNCHECKED_PERIOD);
        self.list
            .iter()
            .filter(|peer| peer.score == 0 && peer.last_time < cutoff)
            .cloned()
            .collect()
    }

    fn peer_mut(&mut self, address: &str) -> Option<&mut Peer> {
        let index = *self.lookup.get(address)?;
        self.list.get_mut(index)
    }

    /// Returns false if the address is unknown.
    pub fn update_score(&mut self, address: &str, delta: i32) -> bool {
        match self.peer_mut(address) {
            Some(peer) => {
                peer.last_time = timestamp_secs();
                peer.score += delta;
                true
            }
            None => false,
        }
    }

    pub fn update_time(&mut self, address: &str) -> bool {
        match self.peer_mut(address) {
            Some(peer) => {
                peer.last_time = timestamp_secs();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.list.clear();
        self.lookup.clear();
        self.storage.remove(PEERS_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const ADDRESS: &str = "10.0.0.1:8333";

    #[test]
    fn add_and_score() {
        let mut repo = PeerRepository::new(Arc::new(MemoryStorage::new()));

        assert!(repo.add(ADDRESS));
        assert!(!repo.add(ADDRESS));
        assert!(repo.update_score(ADDRESS, -1));
        assert!(!repo.update_score("10.0.0.2:8333", 5));

        assert_eq!(repo.count(), 1);
        assert!(repo.get(0).is_empty());
        assert_eq!(repo.get(-1)[0].score, -1);
    }

    #[test]
    fn unchecked_peers() {
        let mut repo = PeerRepository::new(Arc::new(MemoryStorage::new()));
        repo.add(ADDRESS);
        repo.add("10.0.0.2:8333");

        repo.update_time("10.0.0.2:8333");

        let unchecked = repo.unchecked();
        assert_eq!(unchecked.len(), 1);
        assert_eq!(unchecked[0].address, ADDRESS);
    }

    #[test]
    fn save_load_clear() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = PeerRepository::new(storage.clone());
        repo.add(ADDRESS);
        repo.update_score(ADDRESS, 5);
        repo.save().unwrap();

        let mut loaded = PeerRepository::new(storage.clone());
        loaded.load().unwrap();

        assert_eq!(loaded.get(5)[0].address, ADDRESS);
        loaded.clear().unwrap();
        assert_eq!(loaded.count(), 0);
        repo.load().unwrap();
        assert_eq!(repo.count(), 0);
    }
}
