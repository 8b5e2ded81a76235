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

//! 32 bytes hash used to identify blocks, transactions and outpoints.
//!
//! Identities are computed as double SHA-256 of the wire serialization.
//! The bytes are kept in internal (little endian) order, while the textual
//! representation follows the network convention of reversed hex.

use crate::{Error, ErrorKind, Result};
use ring::digest;
use serde::{de::Visitor, Deserializer, Serializer};
use std::{fmt, str::FromStr};

/// Hash length in bytes.
pub const HASH32_SIZE: usize = 32;

#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Hash32([u8; HASH32_SIZE]);

impl Hash32 {
    /// Wraps bytes already in internal order.
    pub fn new(bytes: [u8; HASH32_SIZE]) -> Self {
        Hash32(bytes)
    }

    /// Construct from a bytes slice in internal order.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HASH32_SIZE {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("hash32 length {}", bytes.len()),
            ));
        }
        let mut hash = Hash32::default();
        hash.0.copy_from_slice(bytes);
        Ok(hash)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Double SHA-256 of arbitrary data.
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = digest::digest(&digest::SHA256, data);
        let second = digest::digest(&digest::SHA256, first.as_ref());
        let mut hash = Hash32::default();
        hash.0.copy_from_slice(second.as_ref());
        hash
    }

    /// Single SHA-256, used for record identifiers that never hit the wire.
    pub fn sha256(data: &[u8]) -> Self {
        let digest = digest::digest(&digest::SHA256, data);
        let mut hash = Hash32::default();
        hash.0.copy_from_slice(digest.as_ref());
        hash
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl AsRef<[u8]> for Hash32 {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self)
    }
}

/// Parses the reversed hex representation.
impl FromStr for Hash32 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut buf = hex::decode(s).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        buf.reverse();
        Hash32::from_bytes(&buf)
    }
}

impl serde::Serialize for Hash32 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.as_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for Hash32 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Hash32Visitor;

        impl<'v> Visitor<'v> for Hash32Visitor {
            type Value = Hash32;

            fn expecting(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(fmt, "expecting 32 bytes array.")
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Hash32::from_bytes(bytes).map_err(|_err| serde::de::Error::custom("invalid hash32"))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }
        deserializer.deserialize_byte_buf(Hash32Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};

    const HELLO_DOUBLE_SHA256_HEX: &str =
        "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50";

    #[test]
    fn double_sha256() {
        let hash = Hash32::double_sha256(b"hello");

        assert_eq!(hex::encode(hash.as_bytes()), HELLO_DOUBLE_SHA256_HEX);
    }

    #[test]
    fn display_is_reversed() {
        let mut bytes = [0u8; HASH32_SIZE];
        bytes[0] = 0x01;
        let hash = Hash32::new(bytes);

        let text = hash.to_string();

        assert!(text.ends_with("01"));
        assert_eq!(text.parse::<Hash32>().unwrap(), hash);
    }

    #[test]
    fn parse_bad_length() {
        let err = "0011".parse::<Hash32>().unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn serde_as_bytes() {
        let hash = Hash32::double_sha256(b"hello");

        let buf = rmp_serialize(&hash).unwrap();
        let restored: Hash32 = rmp_deserialize(&buf).unwrap();

        assert_eq!(&buf[..2], &[0xc4, 0x20]);
        assert_eq!(restored, hash);
    }
}
