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

//! Persistence contract used by the repositories.
//!
//! The repositories only need a flat key/value blob store. Keys are `/`
//! separated paths (e.g. `spynode/blocks/00000001`). Two backends are
//! provided: an in-memory map, used by tests and ephemeral nodes, and a
//! directory backed store where every key is a file.

use crate::{base::RwLock, Error, ErrorKind, Result};
#[cfg(test)]
use mockall::automock;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

pub mod blocks;
pub mod peers;
pub mod reorgs;
pub mod txs;

pub use blocks::BlockRepository;
pub use peers::{Peer, PeerRepository};
pub use reorgs::{Reorg, ReorgBlock, ReorgRepository};
pub use txs::{BlockTxs, TxRepository};

/// Blob storage access.
#[cfg_attr(test, automock)]
pub trait Storage: Send + Sync + 'static {
    /// Read the data associated with `key`.
    /// A missing key fails with `ResourceNotFound`.
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Create or overwrite `key`.
    fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Sorted list of keys beginning with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub(crate) fn not_found(key: &str) -> Error {
    Error::new_ext(ErrorKind::ResourceNotFound, format!("key {}", key))
}

/// Volatile storage.
#[derive(Default)]
pub struct MemoryStorage {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.map.read().get(key).cloned().ok_or_else(|| not_found(key))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self
            .map
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(keys)
    }
}

/// Directory backed storage. Each key is a file under `root`.
pub struct FileStorage {
    root: PathBuf,
}

fn io_error(key: &str, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => not_found(key),
        _ => Error::new_ext(ErrorKind::StorageFault, format!("key {}: {}", key, err)),
    }
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| Error::new_ext(ErrorKind::StorageFault, err))?;
        Ok(FileStorage { root })
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let key: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                keys.push(key.join("/"));
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.path(key)).map_err(|err| io_error(key, err))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(key, err))?;
        }
        fs::write(path, data).map_err(|err| io_error(key, err))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(io_error(key, err)),
            _ => Ok(()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = vec![];
        self.collect_keys(&self.root, &mut keys)
            .map_err(|err| io_error(prefix, err))?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
