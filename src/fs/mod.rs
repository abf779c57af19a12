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

//! Filesystem abstraction.
//!
//! Every durability-sensitive component (journal, entry log, index files) goes
//! through this trait rather than `std::fs` directly, so tests can swap in
//! [`memory::MemFs`] and exercise crash-like behavior (partial writes, torn
//! tails) without touching disk. Follows the split in
//! `engine/storage/common/interface/fs_traits.rs` between a filesystem trait
//! and a file trait.

pub mod disk;
pub mod memory;

use crate::error::BookieResult;

#[derive(Debug, PartialEq)]
pub enum FileOpen<F> {
    Created(F),
    Existing(F),
}

impl<F> FileOpen<F> {
    pub fn into_inner(self) -> F {
        match self {
            Self::Created(f) | Self::Existing(f) => f,
        }
    }
}

/// A filesystem capable of hosting bookie's data, journal, and index files.
pub trait FsProvider: Send + Sync + 'static {
    type File: BookieFile;
    /// held for as long as a data directory is in use; dropped on shutdown
    /// or process exit to release the advisory lock. Pins a single writer
    /// to the directory at the OS level, the same `flock(2)` idiom as
    /// `util/os/flock.rs`
    type DirLock: Send + Sync + 'static;

    fn create_dir_all(&self, path: &str) -> BookieResult<()>;
    fn remove_dir_all(&self, path: &str) -> BookieResult<()>;
    fn remove_file(&self, path: &str) -> BookieResult<()>;
    fn rename(&self, from: &str, to: &str) -> BookieResult<()>;
    fn exists(&self, path: &str) -> bool;
    fn read_dir(&self, path: &str) -> BookieResult<Vec<String>>;
    /// open for read/write, creating the file if absent
    fn open_or_create(&self, path: &str) -> BookieResult<FileOpen<Self::File>>;
    /// open an existing file for read/write; error if absent
    fn open(&self, path: &str) -> BookieResult<Self::File>;
    /// available free space for the directory that `path` lives under, in bytes
    fn free_space(&self, path: &str) -> BookieResult<u64>;
    /// acquire an exclusive, non-blocking advisory lock on `path`, failing
    /// if another live process already holds it
    fn lock_dir(&self, path: &str) -> BookieResult<Self::DirLock>;
}

/// A single open file. All positional ops act on an internal cursor.
pub trait BookieFile: Send {
    fn read_exact(&mut self, buf: &mut [u8]) -> BookieResult<()>;
    fn write_all(&mut self, buf: &[u8]) -> BookieResult<()>;
    /// flush any userspace buffering to the OS (does not imply durability)
    fn flush(&mut self) -> BookieResult<()>;
    /// force data + metadata to stable storage
    fn sync_all(&mut self) -> BookieResult<()>;
    fn len(&self) -> BookieResult<u64>;
    fn is_empty(&self) -> BookieResult<bool> {
        Ok(self.len()? == 0)
    }
    fn seek_from_start(&mut self, pos: u64) -> BookieResult<()>;
    fn cursor(&mut self) -> BookieResult<u64>;
    fn truncate(&mut self, len: u64) -> BookieResult<()>;
    fn is_eof(&mut self) -> BookieResult<bool> {
        Ok(self.cursor()? >= self.len()?)
    }
}
