/*
 * This file is part of Bookie.
 *
 * Bookie is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Error taxonomy for the bookie core.

use std::{fmt, io};

pub type BookieResult<T> = Result<T, Error>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// no such ledger is known to this bookie
    NoLedger,
    /// the ledger is known but the entry id was never written here
    NoEntry,
    /// the ledger is fenced; normal writes are refused
    LedgerFenced,
    /// the supplied master key doesn't match the one on record
    UnauthorizedAccess,
    /// every configured directory is full or failed
    NoWritableDir,
    /// this bookie has transitioned to read-only and refuses writes
    ReadOnly,
    /// on-disk / metadata-service cookies don't agree
    InvalidCookie,
    /// the metadata-service collaborator failed or is unavailable
    Metadata,
    /// an I/O operation failed
    Io,
    /// a blocking operation was interrupted (e.g. during shutdown)
    Interrupted,
    /// on-disk data failed a structural or checksum check
    Corruption,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoLedger => "no such ledger",
            Self::NoEntry => "no such entry",
            Self::LedgerFenced => "ledger is fenced",
            Self::UnauthorizedAccess => "unauthorized: master key mismatch",
            Self::NoWritableDir => "no writable directory available",
            Self::ReadOnly => "bookie is read-only",
            Self::InvalidCookie => "cookie mismatch",
            Self::Metadata => "metadata service error",
            Self::Io => "I/O error",
            Self::Interrupted => "interrupted",
            Self::Corruption => "on-disk data corrupted",
        };
        f.write_str(s)
    }
}

/// An error with a kind and an optional human-readable detail message.
///
/// A nested `ErrorKind::{Storage,Txn,Config}` split exists elsewhere to unify
/// several unrelated subsystems; this crate has exactly one failure domain,
/// so `ErrorKind` is flat.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }
    pub fn with_kind(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{}: {}", self.kind, d),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::Interrupted {
            return Error::new(ErrorKind::Interrupted, e.to_string());
        }
        Error::new(ErrorKind::Io, e.to_string())
    }
}

/// Extension trait mirroring the common `ErrorContext` pattern, trimmed to
/// the one thing call sites actually need here: attaching a detail message
/// without losing the classified kind.
pub trait ErrorContext<T> {
    fn ctx(self, detail: impl Into<String>) -> BookieResult<T>;
}

impl<T, E: Into<Error>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, detail: impl Into<String>) -> BookieResult<T> {
        self.map_err(|e| {
            let e: Error = e.into();
            Error::new(e.kind, detail.into())
        })
    }
}
