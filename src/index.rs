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

//! IndexFiles: the on-disk, paged `entry_id -> (log_id, offset)` index. One
//! file per ledger, laid out as a small header followed by fixed-size pages
//! of fixed-size slots so a page can be read or written in one I/O without
//! parsing anything around it.
//!
//! Slot format (12 bytes): `[log_id: u32][offset: u64]`. An all-ones slot
//! (`log_id == u32::MAX`) means "no entry recorded here yet" — `0` is a
//! legitimate `log_id` for the very first entry log segment, so it can't
//! double as the absent marker.
//!
//! Header format: `[header_len: u32][key_len: u32][master_key][fenced: u8]`.
//! This is the ledger's one copy of its master key and fenced bit that
//! doesn't live in the journal, so it survives `Journal::trim_to` deleting
//! whatever journal file the ledger's one-time key/fence records happened to
//! land in. Written once at ledger creation and never moved; `fenced` is the
//! only byte ever rewritten in place afterwards.

use crate::{
    dirs::LedgerDirs,
    error::{BookieResult, Error, ErrorKind},
    fs::{BookieFile, FsProvider},
};
use std::sync::Arc;

pub const SLOT_LEN: u64 = 12;
const ABSENT_LOG_ID: u32 = u32::MAX;
const HEADER_LEN_PREFIX: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub log_id: u32,
    pub offset: u64,
}

impl Location {
    pub const ABSENT: Location = Location {
        log_id: ABSENT_LOG_ID,
        offset: 0,
    };

    pub fn is_absent(&self) -> bool {
        self.log_id == ABSENT_LOG_ID
    }

    fn encode(&self) -> [u8; SLOT_LEN as usize] {
        let mut buf = [0u8; SLOT_LEN as usize];
        buf[0..4].copy_from_slice(&self.log_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            log_id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
        }
    }
}

/// Two-level fan-out so a single `current/` directory never has to hold one
/// file per ledger: `<ledgerIdHi>/<ledgerIdLo>.idx`.
fn ledger_components(ledger_id: i64) -> (String, String) {
    let id = ledger_id as u64;
    let hi = (id >> 32) as u32;
    let lo = (id & 0xFFFF_FFFF) as u32;
    (format!("{hi:x}"), format!("{lo:x}"))
}

fn index_dir(dir: &str, ledger_id: i64) -> String {
    let (hi, _) = ledger_components(ledger_id);
    format!("{dir}/current/{hi}")
}

fn index_path(dir: &str, ledger_id: i64) -> String {
    let (hi, lo) = ledger_components(ledger_id);
    format!("{dir}/current/{hi}/{lo}.idx")
}

/// Opens and addresses per-ledger index files. Holds no cached pages itself
/// — [`crate::cache::LedgerCache`] is the layer with a memory budget; this
/// type is the dumb, always-correct fallback it's built on.
pub struct IndexFiles<F: FsProvider> {
    fs: F,
    dirs: Arc<LedgerDirs<F>>,
    entries_per_page: u64,
}

impl<F: FsProvider> IndexFiles<F> {
    pub fn new(fs: F, dirs: Arc<LedgerDirs<F>>, entries_per_page: u64) -> Self {
        Self {
            fs,
            dirs,
            entries_per_page,
        }
    }

    pub fn entries_per_page(&self) -> u64 {
        self.entries_per_page
    }

    pub fn page_of(&self, entry_id: u64) -> (u64, u64) {
        (entry_id / self.entries_per_page, entry_id % self.entries_per_page)
    }

    fn find_existing(&self, ledger_id: i64) -> Option<String> {
        self.dirs
            .all_dirs()
            .into_iter()
            .find(|dir| self.fs.exists(&index_path(dir, ledger_id)))
    }

    fn open_or_create(&self, ledger_id: i64) -> BookieResult<F::File> {
        let dir = match self.find_existing(ledger_id) {
            Some(dir) => dir,
            None => self.dirs.pick_for_new_file()?,
        };
        self.fs.create_dir_all(&index_dir(&dir, ledger_id))?;
        Ok(self.fs.open_or_create(&index_path(&dir, ledger_id))?.into_inner())
    }

    fn header_len(master_key_len: usize) -> u64 {
        HEADER_LEN_PREFIX + 4 + master_key_len as u64 + 1
    }

    /// Create the header for a brand-new ledger if one isn't already there.
    /// No-op (not an overwrite) if a header already exists, so replay and
    /// recovery can call this unconditionally.
    pub fn create_header_if_absent(&self, ledger_id: i64, master_key: &[u8]) -> BookieResult<()> {
        if self.read_header(ledger_id)?.is_some() {
            return Ok(());
        }
        let header_len = Self::header_len(master_key.len());
        let mut buf = Vec::with_capacity(header_len as usize);
        buf.extend_from_slice(&(header_len as u32).to_be_bytes());
        buf.extend_from_slice(&(master_key.len() as u32).to_be_bytes());
        buf.extend_from_slice(master_key);
        buf.push(0); // fenced = false
        let mut file = self.open_or_create(ledger_id)?;
        file.seek_from_start(0)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read the persisted master key and fenced bit, if this ledger's index
    /// file has ever had a header written. Returns `None` if the ledger has
    /// no index file, or the file is too short to hold one (never written).
    pub fn read_header(&self, ledger_id: i64) -> BookieResult<Option<(Vec<u8>, bool)>> {
        let dir = match self.find_existing(ledger_id) {
            Some(dir) => dir,
            None => return Ok(None),
        };
        let mut file = self.fs.open(&index_path(&dir, ledger_id))?;
        let len = file.len()?;
        if len < HEADER_LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; HEADER_LEN_PREFIX as usize];
        file.seek_from_start(0)?;
        file.read_exact(&mut prefix)?;
        let header_len = u32::from_be_bytes(prefix) as u64;
        if header_len < HEADER_LEN_PREFIX + 4 + 1 || len < header_len {
            return Ok(None);
        }
        let mut rest = vec![0u8; (header_len - HEADER_LEN_PREFIX) as usize];
        file.read_exact(&mut rest)?;
        let key_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
        if 4 + key_len + 1 != rest.len() {
            return Ok(None);
        }
        let master_key = rest[4..4 + key_len].to_vec();
        let fenced = rest[4 + key_len] != 0;
        Ok(Some((master_key, fenced)))
    }

    /// Flip the persisted fenced bit. Requires the header to already exist.
    pub fn set_fenced(&self, ledger_id: i64, fenced: bool) -> BookieResult<()> {
        let dir = self
            .find_existing(ledger_id)
            .ok_or_else(|| Error::with_kind(ErrorKind::NoLedger))?;
        let mut file = self.fs.open(&index_path(&dir, ledger_id))?;
        let mut prefix = [0u8; HEADER_LEN_PREFIX as usize];
        file.seek_from_start(0)?;
        file.read_exact(&mut prefix)?;
        let header_len = u32::from_be_bytes(prefix) as u64;
        if header_len < HEADER_LEN_PREFIX + 4 + 1 {
            return Err(Error::new(ErrorKind::Corruption, format!("index header missing for ledger {ledger_id}")));
        }
        file.seek_from_start(header_len - 1)?;
        file.write_all(&[fenced as u8])?;
        file.sync_all()?;
        Ok(())
    }

    fn pages_base_offset(&self, file: &mut F::File) -> BookieResult<u64> {
        let len = file.len()?;
        if len == 0 {
            // brand new (or just-deleted-and-recreated) file: no header yet,
            // so there can be no pages either. Treat as base offset zero
            // rather than erroring; `read_page` will synthesize an
            // all-absent page as before.
            return Ok(0);
        }
        if len < HEADER_LEN_PREFIX {
            return Err(Error::new(ErrorKind::Corruption, "index file truncated before its header".to_string()));
        }
        let mut prefix = [0u8; HEADER_LEN_PREFIX as usize];
        file.seek_from_start(0)?;
        file.read_exact(&mut prefix)?;
        Ok(u32::from_be_bytes(prefix) as u64)
    }

    /// Read page `page_id` for `ledger_id`. Never errors for a page that
    /// hasn't been written yet — it's treated as all-absent slots. The
    /// ledger's header (master key + fenced bit) must already have been
    /// created; pages are always addressed relative to it.
    pub fn read_page(&self, ledger_id: i64, page_id: u64) -> BookieResult<Vec<Location>> {
        let mut file = self.open_or_create(ledger_id)?;
        let base = self.pages_base_offset(&mut file)?;
        let page_bytes = self.entries_per_page * SLOT_LEN;
        let start = base + page_id * page_bytes;
        let len = file.len()?;
        let mut out = Vec::with_capacity(self.entries_per_page as usize);
        if start >= len {
            out.resize(self.entries_per_page as usize, Location::ABSENT);
            return Ok(out);
        }
        let readable = (len - start).min(page_bytes);
        let mut buf = vec![0u8; readable as usize];
        file.seek_from_start(start)?;
        file.read_exact(&mut buf)?;
        buf.resize(page_bytes as usize, 0xFF);
        for slot in buf.chunks_exact(SLOT_LEN as usize) {
            out.push(Location::decode(slot));
        }
        Ok(out)
    }

    /// Write a full page back, zero-padding the file up to this page's
    /// start if it was shorter.
    pub fn write_page(&self, ledger_id: i64, page_id: u64, page: &[Location]) -> BookieResult<()> {
        let mut file = self.open_or_create(ledger_id)?;
        let base = self.pages_base_offset(&mut file)?;
        let page_bytes = self.entries_per_page * SLOT_LEN;
        let start = base + page_id * page_bytes;
        let len = file.len()?;
        if len < start {
            file.seek_from_start(len)?;
            let pad = vec![0xFFu8; (start - len) as usize];
            file.write_all(&pad)?;
        }
        let mut buf = Vec::with_capacity(page_bytes as usize);
        for loc in page {
            buf.extend_from_slice(&loc.encode());
        }
        file.seek_from_start(start)?;
        file.write_all(&buf)?;
        Ok(())
    }

    pub fn flush(&self, ledger_id: i64) -> BookieResult<()> {
        self.open_or_create(ledger_id)?.sync_all()
    }

    /// Unlink the index file for a ledger the metadata service has reported
    /// deleted.
    pub fn delete_ledger(&self, ledger_id: i64) -> BookieResult<()> {
        if let Some(dir) = self.find_existing(ledger_id) {
            self.fs.remove_file(&index_path(&dir, ledger_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memory::MemFs;

    fn fixture() -> IndexFiles<MemFs> {
        let fs = MemFs::new();
        let dirs = LedgerDirs::new(fs.clone(), vec!["/d".into()], 0).unwrap();
        IndexFiles::new(fs, dirs, 4)
    }

    #[test]
    fn unwritten_page_reads_as_all_absent() {
        let idx = fixture();
        idx.create_header_if_absent(1, b"k").unwrap();
        let page = idx.read_page(1, 0).unwrap();
        assert!(page.iter().all(Location::is_absent));
    }

    #[test]
    fn write_then_read_page_roundtrips() {
        let idx = fixture();
        idx.create_header_if_absent(1, b"k").unwrap();
        let mut page = idx.read_page(1, 0).unwrap();
        page[2] = Location { log_id: 5, offset: 1024 };
        idx.write_page(1, 0, &page).unwrap();
        let reread = idx.read_page(1, 0).unwrap();
        assert_eq!(reread[2], Location { log_id: 5, offset: 1024 });
        assert!(reread[0].is_absent());
    }

    #[test]
    fn page_of_splits_entry_id_correctly() {
        let idx = fixture();
        assert_eq!(idx.page_of(0), (0, 0));
        assert_eq!(idx.page_of(3), (0, 3));
        assert_eq!(idx.page_of(4), (1, 0));
        assert_eq!(idx.page_of(9), (2, 1));
    }

    #[test]
    fn header_roundtrips_master_key_and_fenced_bit() {
        let idx = fixture();
        assert!(idx.read_header(1).unwrap().is_none());
        idx.create_header_if_absent(1, b"top-secret").unwrap();
        let (key, fenced) = idx.read_header(1).unwrap().unwrap();
        assert_eq!(key, b"top-secret");
        assert!(!fenced);

        idx.set_fenced(1, true).unwrap();
        let (key, fenced) = idx.read_header(1).unwrap().unwrap();
        assert_eq!(key, b"top-secret");
        assert!(fenced);
    }

    #[test]
    fn create_header_if_absent_does_not_overwrite_an_existing_header() {
        let idx = fixture();
        idx.create_header_if_absent(1, b"first").unwrap();
        idx.set_fenced(1, true).unwrap();
        idx.create_header_if_absent(1, b"first").unwrap();
        let (key, fenced) = idx.read_header(1).unwrap().unwrap();
        assert_eq!(key, b"first");
        assert!(fenced, "a second create_header_if_absent call must not reset fenced");
    }

    #[test]
    fn set_fenced_on_a_ledger_with_no_header_is_no_ledger() {
        let idx = fixture();
        let err = idx.set_fenced(1, true).unwrap_err();
        assert!(err.is(ErrorKind::NoLedger));
    }

    #[test]
    fn header_survives_across_pages_and_ledgers_with_different_key_lengths() {
        let idx = fixture();
        idx.create_header_if_absent(1, b"short").unwrap();
        idx.create_header_if_absent(2, b"a-much-longer-master-key-than-the-first-one").unwrap();
        let mut page = idx.read_page(1, 0).unwrap();
        page[0] = Location { log_id: 1, offset: 11 };
        idx.write_page(1, 0, &page).unwrap();
        let mut page2 = idx.read_page(2, 0).unwrap();
        page2[0] = Location { log_id: 2, offset: 22 };
        idx.write_page(2, 0, &page2).unwrap();
        assert_eq!(idx.read_page(1, 0).unwrap()[0], Location { log_id: 1, offset: 11 });
        assert_eq!(idx.read_page(2, 0).unwrap()[0], Location { log_id: 2, offset: 22 });
        assert_eq!(idx.read_header(1).unwrap().unwrap().0, b"short");
        assert_eq!(idx.read_header(2).unwrap().unwrap().0, b"a-much-longer-master-key-than-the-first-one");
    }

    #[test]
    fn index_path_fans_ledgers_out_across_a_hi_lo_directory_split() {
        assert_eq!(index_path("/d", 1), "/d/current/0/1.idx");
        assert_eq!(index_path("/d", 0x1_0000_0001), "/d/current/1/1.idx");
    }
}
