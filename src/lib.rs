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

//! # Bookie
//!
//! A single-node, append-only storage server for entries belonging to many
//! independent logs ("ledgers"). This crate is the **core** durability and
//! storage engine only: the write-ahead journal, the interleaved entry log,
//! the lazily-flushed index cache, the fence state machine, and the
//! checkpoint/recovery protocol that ties them together.
//!
//! The replication protocol, client ensemble selection, quorum writing,
//! ledger recovery, wire protocol / RPC server, and metadata-service
//! implementation are out of scope; this crate only defines the interfaces
//! it consumes from them ([`fs::FsProvider`], [`metadata::MetadataClient`])
//! and exposes the facade ([`bookie::Bookie`]) an embedding server drives.
//!
//! See the module docs for each component for the corresponding part of the
//! design: [`dirs`], [`journal`], [`entrylog`], [`index`], [`cache`],
//! [`ledger`], [`sync`], [`gc`], [`bookie`].

pub mod bookie;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod cookie;
pub mod dirs;
pub mod entrylog;
pub mod error;
pub mod fs;
pub mod gc;
pub mod index;
pub mod journal;
pub mod ledger;
pub mod metadata;
pub mod sync;

pub use bookie::Bookie;
pub use config::BookieConfig;
pub use error::{BookieResult, Error, ErrorKind};
