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

//! Transaction model. Only the encoding needed to derive identities is
//! implemented here: parsing raw bytes belongs to the transport codec.

use super::write_var_int;
use crate::crypto::Hash32;

/// Reference to a previous transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash32,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash32, index: u32) -> Self {
        OutPoint { hash, index }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.hash.as_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
    }

    /// Key used by the mempool to detect double spends.
    pub fn outpoint_hash(&self) -> Hash32 {
        let mut buf = Vec::with_capacity(36);
        self.write(&mut buf);
        Hash32::double_sha256(&buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_outpoint: OutPoint,
    #[serde(with = "serde_bytes")]
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(previous_outpoint: OutPoint, signature_script: Vec<u8>) -> Self {
        TxIn {
            previous_outpoint,
            signature_script,
            sequence: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    #[serde(with = "serde_bytes")]
    pub pk_script: Vec<u8>,
}

impl TxOut {
    pub fn new(value: i64, pk_script: Vec<u8>) -> Self {
        TxOut { value, pk_script }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgTx {
    pub version: i32,
    pub tx_in: Vec<TxIn>,
    pub tx_out: Vec<TxOut>,
    pub lock_time: u32,
}

impl MsgTx {
    pub fn new(version: i32) -> Self {
        MsgTx {
            version,
            tx_in: vec![],
            tx_out: vec![],
            lock_time: 0,
        }
    }

    pub fn add_tx_in(&mut self, input: TxIn) {
        self.tx_in.push(input);
    }

    pub fn add_tx_out(&mut self, output: TxOut) {
        self.tx_out.push(output);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialize_size());
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_var_int(&mut buf, self.tx_in.len() as u64);
        for input in &self.tx_in {
            input.previous_outpoint.write(&mut buf);
            write_var_int(&mut buf, input.signature_script.len() as u64);
            buf.extend_from_slice(&input.signature_script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_var_int(&mut buf, self.tx_out.len() as u64);
        for output in &self.tx_out {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_var_int(&mut buf, output.pk_script.len() as u64);
            buf.extend_from_slice(&output.pk_script);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    pub fn serialize_size(&self) -> usize {
        let inputs: usize = self
            .tx_in
            .iter()
            .map(|input| {
                40 + super::var_int_size(input.signature_script.len() as u64)
                    + input.signature_script.len()
            })
            .sum();
        let outputs: usize = self
            .tx_out
            .iter()
            .map(|output| {
                8 + super::var_int_size(output.pk_script.len() as u64) + output.pk_script.len()
            })
            .sum();
        8 + super::var_int_size(self.tx_in.len() as u64)
            + inputs
            + super::var_int_size(self.tx_out.len() as u64)
            + outputs
    }

    pub fn tx_hash(&self) -> Hash32 {
        Hash32::double_sha256(&self.serialize())
    }

    /// A coinbase spends the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.tx_in.len() == 1
            && self.tx_in[0].previous_outpoint.hash.is_zero()
            && self.tx_in[0].previous_outpoint.index == u32::MAX
    }
}
