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

//! Txs announced by a peer while another request for them was in flight.
//!
//! If the first request is never answered the mempool lets the request
//! expire, and the next `check` asks again from the connection running it.

use super::{mempool::MemPool, requests::GetDataBatch, TRACKER_FLUSH_COUNT};
use crate::{
    base::{timestamp_millis, Mutex},
    crypto::Hash32,
    wire::{InvType, Message},
    Result,
};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

#[derive(Default)]
pub struct TxTracker {
    /// Tracked ids with the first announcement time (ms).
    txids: Mutex<HashMap<Hash32, u64>>,
    stop: AtomicBool,
}

impl TxTracker {
    pub fn new() -> Self {
        TxTracker::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Track `txid`. The first announcement time is kept.
    pub fn add(&self, txid: &Hash32) {
        self.txids
            .lock()
            .entry(*txid)
            .or_insert_with(timestamp_millis);
    }

    pub fn remove(&self, txid: &Hash32) -> bool {
        self.txids.lock().remove(txid).is_some()
    }

    pub fn remove_list(&self, txids: &[Hash32]) {
        let mut tracked = self.txids.lock();
        for txid in txids {
            tracked.remove(txid);
        }
    }

    pub fn contains(&self, txid: &Hash32) -> bool {
        self.txids.lock().contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.txids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the `getdata` messages for the tracked txs whose previous
    /// request expired. Received txs are dropped from the tracker.
    pub fn check(&self, mempool: &MemPool) -> Result<Vec<Message>> {
        if self.is_stopped() {
            return Ok(vec![]);
        }

        let mut tracked = self.txids.lock();
        let mut batch = GetDataBatch::new();
        let mut handled = vec![];
        let mut count = 0;
        for txid in tracked.keys() {
            if self.is_stopped() {
                break;
            }
            let (already_have, should_request) = mempool.add_request(txid, false);
            if already_have {
                handled.push(*txid);
            } else if should_request {
                batch.add(InvType::Tx, *txid)?;
                handled.push(*txid);
                count += 1;
                if count > TRACKER_FLUSH_COUNT {
                    batch.flush();
                    count = 0;
                }
            }
        }
        for txid in &handled {
            tracked.remove(txid);
        }

        let messages = batch.finish();
        if !messages.is_empty() {
            debug!("[tracker] requesting {} tracked txs", handled.len());
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{tx::tests::create_spend_tx, OutPoint};
    use std::{sync::Arc, thread};

    fn txid(n: u32) -> Hash32 {
        Hash32::double_sha256(&n.to_le_bytes())
    }

    #[test]
    fn add_remove() {
        let tracker = TxTracker::new();

        tracker.add(&txid(1));
        tracker.add(&txid(1));
        tracker.add(&txid(2));
        tracker.add(&txid(3));

        assert_eq!(tracker.len(), 3);
        assert!(tracker.remove(&txid(1)));
        assert!(!tracker.remove(&txid(1)));
        tracker.remove_list(&[txid(2), txid(3)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn check_requests_expired() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        let expired = txid(1);
        let pending = txid(2);
        mempool.add_request_at(&expired, true, 0);
        mempool.add_request(&pending, true);
        tracker.add(&expired);
        tracker.add(&pending);

        let messages = tracker.check(&mempool).unwrap();

        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::GetData(msg) => {
                assert_eq!(msg.inv_list.len(), 1);
                assert_eq!(msg.inv_list[0].hash, expired);
            }
            _ => panic!("unexpected message"),
        }
        assert!(!tracker.contains(&expired));
        assert!(tracker.contains(&pending));
    }

    #[test]
    fn check_drops_received() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        let tx = create_spend_tx(OutPoint::new(txid(9), 0), 1);
        mempool.add_transaction(&tx, false);
        tracker.add(&tx.tx_hash());

        let messages = tracker.check(&mempool).unwrap();

        assert!(messages.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn check_splits_large_batches() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        let total = 2 * (TRACKER_FLUSH_COUNT as u32 + 1) + 5;
        for n in 0..total {
            tracker.add(&txid(n));
        }

        let messages = tracker.check(&mempool).unwrap();

        assert_eq!(messages.len(), 3);
        assert!(tracker.is_empty());
    }

    #[test]
    fn stopped_tracker_is_idle() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        tracker.add(&txid(1));
        tracker.stop();

        let messages = tracker.check(&mempool).unwrap();

        assert!(messages.is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn check_races_mempool_announcements() {
        let mempool = Arc::new(MemPool::new());
        let tracker = TxTracker::new();
        for n in 0..200 {
            tracker.add(&txid(n));
        }

        let announcer = {
            let mempool = mempool.clone();
            thread::spawn(move || {
                (0..200)
                    .filter(|n| mempool.add_request(&txid(*n), true).1)
                    .count()
            })
        };
        let messages = tracker.check(&mempool).unwrap();
        let announced = announcer.join().unwrap();

        let requested: usize = messages
            .iter()
            .map(|msg| match msg {
                Message::GetData(data) => data.inv_list.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(announced + requested, 200);
        assert_eq!(tracker.len(), 200 - requested);
    }
}
