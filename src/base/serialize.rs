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

//! MessagePack helpers used by the repositories to persist their records.

use crate::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Serialize using MessagePack format (without field names).
///
/// # Error
///
/// If the data cannot be serialized a `MalformedData` error kind is returned.
pub fn rmp_serialize<T>(val: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    rmp_serde::to_vec(val).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Deserialize using MessagePack format.
///
/// # Error
///
/// If the data cannot be deserialized a `MalformedData` error kind is returned.
pub fn rmp_deserialize<'a, T>(buf: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    rmp_serde::from_slice(buf).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct PeerRecord {
        address: String,
        score: i32,
        last_time: u32,
    }

    const PEER_RECORD_HEX: &str = "93ae3132372e302e302e313a38333333fe00";

    fn create_record() -> PeerRecord {
        PeerRecord {
            address: "127.0.0.1:8333".to_string(),
            score: -2,
            last_time: 0,
        }
    }

    #[test]
    fn record_serialize() {
        let record = create_record();

        let buf = rmp_serialize(&record).unwrap();

        assert_eq!(hex::encode(&buf), PEER_RECORD_HEX);
    }

    #[test]
    fn record_deserialize() {
        let buf = hex::decode(PEER_RECORD_HEX).unwrap();

        let record: PeerRecord = rmp_deserialize(&buf).unwrap();

        assert_eq!(record, create_record());
    }

    #[test]
    fn truncated_record() {
        let buf = hex::decode(&PEER_RECORD_HEX[..10]).unwrap();

        let err = rmp_deserialize::<PeerRecord>(&buf).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }
}
