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

//! Typed model of the P2P messages the engine consumes and produces.
//!
//! Framing and raw decoding are owned by the connection layer; everything in
//! here is already narrowed to a closed set of variants, so the handlers
//! never have to guess what they are looking at.

pub mod block;
pub mod header;
pub mod messages;
pub mod network;
pub mod tx;

pub use block::MsgBlock;
pub use header::BlockHeader;
pub use messages::{
    InvType, InvVect, MsgAddr, MsgGetData, MsgGetHeaders, MsgHeaders, MsgInv, MsgPing, MsgPong,
    MsgReject, MsgVersion, NetAddress,
};
pub use network::Network;
pub use tx::{MsgTx, OutPoint, TxIn, TxOut};

use crate::{Error, ErrorKind, Result};
use std::{fmt, str::FromStr};

/// Serialized block header size.
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Max inventory vectors carried by a single `inv` or `getdata`.
pub const MAX_INV_PER_MSG: usize = 50_000;

/// Protocol version advertised in `version` and `getheaders`.
pub const PROTOCOL_VERSION: u32 = 70015;

/// Little endian u32 from the first four bytes of `buf`.
pub(crate) fn read_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(bytes)
}

/// Appends a compact size integer.
pub(crate) fn write_var_int(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

pub(crate) fn var_int_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Wire command names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    VerAck,
    Addr,
    GetAddr,
    Inv,
    GetData,
    Tx,
    Block,
    Headers,
    GetHeaders,
    SendHeaders,
    MemPool,
    Reject,
    Ping,
    Pong,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::VerAck => "verack",
            Command::Addr => "addr",
            Command::GetAddr => "getaddr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::Tx => "tx",
            Command::Block => "block",
            Command::Headers => "headers",
            Command::GetHeaders => "getheaders",
            Command::SendHeaders => "sendheaders",
            Command::MemPool => "mempool",
            Command::Reject => "reject",
            Command::Ping => "ping",
            Command::Pong => "pong",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let command = match s {
            "version" => Command::Version,
            "verack" => Command::VerAck,
            "addr" => Command::Addr,
            "getaddr" => Command::GetAddr,
            "inv" => Command::Inv,
            "getdata" => Command::GetData,
            "tx" => Command::Tx,
            "block" => Command::Block,
            "headers" => Command::Headers,
            "getheaders" => Command::GetHeaders,
            "sendheaders" => Command::SendHeaders,
            "mempool" => Command::MemPool,
            "reject" => Command::Reject,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            _ => {
                return Err(Error::new_ext(
                    ErrorKind::ProtocolViolation,
                    format!("unknown command `{}`", s),
                ))
            }
        };
        Ok(command)
    }
}

/// Decoded P2P message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(MsgVersion),
    VerAck,
    Addr(MsgAddr),
    GetAddr,
    Inv(MsgInv),
    GetData(MsgGetData),
    Tx(MsgTx),
    Block(Box<MsgBlock>),
    Headers(MsgHeaders),
    GetHeaders(MsgGetHeaders),
    SendHeaders,
    MemPool,
    Reject(MsgReject),
    Ping(MsgPing),
    Pong(MsgPong),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::VerAck => Command::VerAck,
            Message::Addr(_) => Command::Addr,
            Message::GetAddr => Command::GetAddr,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::Tx(_) => Command::Tx,
            Message::Block(_) => Command::Block,
            Message::Headers(_) => Command::Headers,
            Message::GetHeaders(_) => Command::GetHeaders,
            Message::SendHeaders => Command::SendHeaders,
            Message::MemPool => Command::MemPool,
            Message::Reject(_) => Command::Reject,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names() {
        let commands = [
            Command::Version,
            Command::VerAck,
            Command::Addr,
            Command::GetAddr,
            Command::Inv,
            Command::GetData,
            Command::Tx,
            Command::Block,
            Command::Headers,
            Command::GetHeaders,
            Command::SendHeaders,
            Command::MemPool,
            Command::Reject,
            Command::Ping,
            Command::Pong,
        ];

        for command in commands {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
    }

    #[test]
    fn unknown_command() {
        let err = "feefilter".parse::<Command>().unwrap_err();

        assert_eq!(err.kind, ErrorKind::ProtocolViolation);
    }

    #[test]
    fn message_command() {
        let msg = Message::Ping(MsgPing { nonce: 7 });

        assert_eq!(msg.command(), Command::Ping);
        assert_eq!(msg.command().to_string(), "ping");
    }

    #[test]
    fn var_int_encoding() {
        let mut buf = vec![];

        write_var_int(&mut buf, 0xfc);
        write_var_int(&mut buf, 0xfd);
        write_var_int(&mut buf, 0x1_0000);

        assert_eq!(buf, vec![0xfc, 0xfd, 0xfd, 0x00, 0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(var_int_size(0x1_0000_0000), 9);
    }
}
