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

//! Library error codes and results.

use crate::channel::ChannelError;
use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Data that cannot be decoded or that breaks a structural limit.
    MalformedData,
    /// A peer sent something it should never send (e.g. empty or unlinked headers).
    ProtocolViolation,
    /// A block request does not link to the tail of the request queue.
    WrongPreviousHash,
    /// Key, height or record not present.
    ResourceNotFound,
    /// Persistent storage backend failure.
    StorageFault,
    /// Hand-off channel is not open.
    ChannelClosed,
    /// Outstanding header or block request expired.
    RequestTimeout,
    /// Local chain view can no longer be trusted (e.g. a revert landed on the wrong tip).
    InconsistentState,
    Other,
}

/// Error kind strings.
pub(super) mod error_kind_str {
    pub const MALFORMED_DATA: &str = "malformed data";
    pub const PROTOCOL_VIOLATION: &str = "protocol violation";
    pub const WRONG_PREVIOUS_HASH: &str = "wrong previous hash";
    pub const RESOURCE_NOT_FOUND: &str = "resource not found";
    pub const STORAGE_FAULT: &str = "storage fault";
    pub const CHANNEL_CLOSED: &str = "channel closed";
    pub const REQUEST_TIMEOUT: &str = "request timeout";
    pub const INCONSISTENT_STATE: &str = "inconsistent state";
    pub const OTHER: &str = "other";
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        let kind_str = match self {
            MalformedData => error_kind_str::MALFORMED_DATA,
            ProtocolViolation => error_kind_str::PROTOCOL_VIOLATION,
            WrongPreviousHash => error_kind_str::WRONG_PREVIOUS_HASH,
            ResourceNotFound => error_kind_str::RESOURCE_NOT_FOUND,
            StorageFault => error_kind_str::STORAGE_FAULT,
            ChannelClosed => error_kind_str::CHANNEL_CLOSED,
            RequestTimeout => error_kind_str::REQUEST_TIMEOUT,
            InconsistentState => error_kind_str::INCONSISTENT_STATE,
            Other => error_kind_str::OTHER,
        };
        write!(f, "{}", kind_str)
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that may
/// have propagated the error.
#[derive(Debug)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            source: self.source.as_ref().map(|src| src.to_string().into()),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new_ext(ErrorKind::Other, s)
    }
}

impl From<ChannelError> for Error {
    fn from(err: ChannelError) -> Self {
        Error::new_ext(ErrorKind::ChannelClosed, err)
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(Error::new(kind))
    }
}

impl Error {
    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = error.into();
        Error {
            kind,
            source: Some(source),
        }
    }

    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    /// Errors after which the local chain view or its persistence can no
    /// longer be trusted. The sync loop must stop on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InconsistentState | ErrorKind::StorageFault
        )
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let mut max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            while !detail.is_char_boundary(max_len) {
                max_len -= 1;
            }
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (&self.source, &other.source) {
            (None, None) => true,
            (Some(src1), Some(src2)) => src1.to_string() == src2.to_string(),
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}
