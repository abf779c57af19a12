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

//! LedgerCache: a bounded, page-granular cache in front of [`IndexFiles`].
//! Reads and writes to the index go through here so hot
//! ledgers don't pay a disk round-trip per entry; the cache only ever holds
//! `max_pages` resident pages, evicting clean pages before ever having to
//! flush a dirty one to make room.
//!
//! Flushing snapshots a page's bytes and releases the map lock before the
//! disk write, so `get_location`/`set_location` on every other page — and,
//! modulo a short version-check window, this same page — never block on the
//! I/O. A page mutated again while its snapshot is mid-flush is left dirty
//! rather than incorrectly marked clean, so the next checkpoint picks it up.

use crate::{
    error::BookieResult,
    fs::FsProvider,
    index::{IndexFiles, Location},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

type PageKey = (i64, u64);

struct CachedPage {
    data: Vec<Location>,
    dirty: bool,
    last_touched: u64,
    /// bumped on every mutation; lets a flush tell whether the page it
    /// snapshotted is still the page on disk once the write completes.
    version: u64,
}

struct Inner {
    pages: HashMap<PageKey, CachedPage>,
    clock: u64,
}

pub struct LedgerCache<F: FsProvider> {
    index: Arc<IndexFiles<F>>,
    max_pages: usize,
    inner: Mutex<Inner>,
}

impl<F: FsProvider> LedgerCache<F> {
    pub fn new(index: Arc<IndexFiles<F>>, max_pages: usize) -> Self {
        Self {
            index,
            max_pages,
            inner: Mutex::new(Inner {
                pages: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Persist a newly-created ledger's master key and `fenced = false` in
    /// its index file header, if one isn't already there. This is the copy
    /// of the key that survives `Journal::trim_to` deleting the one-time
    /// journal record it was also written to.
    pub fn create_ledger_header(&self, ledger_id: i64, master_key: &[u8]) -> BookieResult<()> {
        self.index.create_header_if_absent(ledger_id, master_key)
    }

    /// Load a ledger's persisted master key and fenced bit, for
    /// reconstructing a handle that isn't resident in memory (because its
    /// one-time journal key record has already been trimmed).
    pub fn read_ledger_header(&self, ledger_id: i64) -> BookieResult<Option<(Vec<u8>, bool)>> {
        self.index.read_header(ledger_id)
    }

    /// Persist a fence durably, independent of the journal.
    pub fn set_ledger_fenced(&self, ledger_id: i64, fenced: bool) -> BookieResult<()> {
        self.index.set_fenced(ledger_id, fenced)
    }

    pub fn get_location(&self, ledger_id: i64, entry_id: u64) -> BookieResult<Location> {
        let (page_id, slot) = self.index.page_of(entry_id);
        let key = (ledger_id, page_id);
        self.touch(key)?;
        let inner = self.inner.lock();
        Ok(inner.pages[&key].data[slot as usize])
    }

    pub fn set_location(&self, ledger_id: i64, entry_id: u64, loc: Location) -> BookieResult<()> {
        let (page_id, slot) = self.index.page_of(entry_id);
        let key = (ledger_id, page_id);
        self.touch(key)?;
        let mut inner = self.inner.lock();
        let page = inner.pages.get_mut(&key).expect("just touched");
        page.data[slot as usize] = loc;
        page.dirty = true;
        page.version += 1;
        Ok(())
    }

    /// Update a slot only if it currently holds `expected`; used by the
    /// compactor to redirect an index entry to its new location without
    /// racing a concurrent writer that's already moved it again.
    pub fn compare_and_swap_location(
        &self,
        ledger_id: i64,
        entry_id: u64,
        expected: Location,
        new: Location,
    ) -> BookieResult<bool> {
        let (page_id, slot) = self.index.page_of(entry_id);
        let key = (ledger_id, page_id);
        self.touch(key)?;
        let mut inner = self.inner.lock();
        let page = inner.pages.get_mut(&key).expect("just touched");
        if page.data[slot as usize] != expected {
            return Ok(false);
        }
        page.data[slot as usize] = new;
        page.dirty = true;
        page.version += 1;
        Ok(true)
    }

    /// Ensure `key` is resident, bumping its recency and evicting if the
    /// cache is over budget. Loads the page from disk on a miss.
    fn touch(&self, key: PageKey) -> BookieResult<()> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        if let Some(page) = inner.pages.get_mut(&key) {
            page.last_touched = clock;
            return Ok(());
        }
        drop(inner);
        let data = self.index.read_page(key.0, key.1)?;
        {
            let mut inner = self.inner.lock();
            inner.pages.entry(key).or_insert(CachedPage {
                data,
                dirty: false,
                last_touched: clock,
                version: 0,
            });
        }
        self.evict_if_over_budget()?;
        Ok(())
    }

    /// Evict pages until resident count is back within budget. Clean pages
    /// are dropped outright; if every resident page is dirty, the least
    /// recently used one is flushed to disk and then dropped. The map lock
    /// is never held across the disk write — it's released for the I/O and
    /// reacquired just to finalize the eviction, so concurrent readers of
    /// other pages are never blocked on it.
    fn evict_if_over_budget(&self) -> BookieResult<()> {
        loop {
            let over = self.inner.lock().pages.len() > self.max_pages;
            if !over {
                return Ok(());
            }
            let clean_victim = {
                let inner = self.inner.lock();
                inner
                    .pages
                    .iter()
                    .filter(|(_, p)| !p.dirty)
                    .min_by_key(|(_, p)| p.last_touched)
                    .map(|(k, _)| *k)
            };
            if let Some(victim) = clean_victim {
                self.inner.lock().pages.remove(&victim);
                continue;
            }
            let lru = {
                let inner = self.inner.lock();
                inner.pages.iter().min_by_key(|(_, p)| p.last_touched).map(|(k, _)| *k)
            };
            let Some(victim) = lru else {
                return Ok(()); // nothing resident; budget can't be exceeded
            };
            let (data, version) = {
                let inner = self.inner.lock();
                let page = &inner.pages[&victim];
                (page.data.clone(), page.version)
            };
            self.index.write_page(victim.0, victim.1, &data)?;
            let mut inner = self.inner.lock();
            match inner.pages.get(&victim) {
                Some(page) if page.version == version => {
                    inner.pages.remove(&victim);
                }
                // re-dirtied while we were flushing it; leave it resident,
                // the next pass will pick a different victim.
                _ => {}
            }
        }
    }

    pub fn flush_ledger(&self, ledger_id: i64) -> BookieResult<()> {
        let snapshot: Vec<(PageKey, Vec<Location>, u64)> = {
            let inner = self.inner.lock();
            inner
                .pages
                .iter()
                .filter(|((l, _), p)| *l == ledger_id && p.dirty)
                .map(|(k, p)| (*k, p.data.clone(), p.version))
                .collect()
        };
        for (key, data, version) in snapshot {
            self.index.write_page(key.0, key.1, &data)?;
            let mut inner = self.inner.lock();
            if let Some(page) = inner.pages.get_mut(&key) {
                if page.version == version {
                    page.dirty = false;
                }
                // else: mutated again during the flush; leave it dirty so
                // the next checkpoint re-flushes the newer write.
            }
        }
        self.index.flush(ledger_id)
    }

    /// Flush every dirty page across every ledger currently resident.
    /// Called by the sync thread on its checkpoint interval.
    pub fn flush_all(&self) -> BookieResult<()> {
        let ledger_ids: std::collections::HashSet<i64> =
            self.inner.lock().pages.keys().map(|(l, _)| *l).collect();
        for ledger_id in ledger_ids {
            self.flush_ledger(ledger_id)?;
        }
        Ok(())
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Drop every resident page for `ledger_id` without flushing, then
    /// unlink its index file. Pairs with `EntryLog`'s own segment deletion
    /// when GC learns a ledger has been removed from the metadata service.
    pub fn delete_ledger(&self, ledger_id: i64) -> BookieResult<()> {
        self.inner.lock().pages.retain(|(l, _), _| *l != ledger_id);
        self.index.delete_ledger(ledger_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dirs::LedgerDirs, fs::memory::MemFs};

    fn fixture(max_pages: usize) -> LedgerCache<MemFs> {
        let fs = MemFs::new();
        let dirs = LedgerDirs::new(fs.clone(), vec!["/d".into()], 0).unwrap();
        let index = Arc::new(IndexFiles::new(fs, dirs, 4));
        LedgerCache::new(index, max_pages)
    }

    #[test]
    fn write_then_read_without_flush() {
        let cache = fixture(8);
        cache.create_ledger_header(1, b"k").unwrap();
        cache.set_location(1, 2, Location { log_id: 9, offset: 100 }).unwrap();
        assert_eq!(cache.get_location(1, 2).unwrap(), Location { log_id: 9, offset: 100 });
    }

    #[test]
    fn flush_persists_to_index_files() {
        let cache = fixture(8);
        cache.create_ledger_header(1, b"k").unwrap();
        cache.set_location(1, 0, Location { log_id: 1, offset: 1 }).unwrap();
        cache.flush_ledger(1).unwrap();
        let fresh = LedgerCache::new(Arc::clone(&cache.index), 8);
        assert_eq!(fresh.get_location(1, 0).unwrap(), Location { log_id: 1, offset: 1 });
    }

    #[test]
    fn compare_and_swap_fails_on_mismatch() {
        let cache = fixture(8);
        cache.create_ledger_header(1, b"k").unwrap();
        cache.set_location(1, 0, Location { log_id: 1, offset: 1 }).unwrap();
        let ok = cache
            .compare_and_swap_location(1, 0, Location { log_id: 2, offset: 2 }, Location::ABSENT)
            .unwrap();
        assert!(!ok);
        assert_eq!(cache.get_location(1, 0).unwrap(), Location { log_id: 1, offset: 1 });
    }

    #[test]
    fn compare_and_swap_succeeds_on_match() {
        let cache = fixture(8);
        cache.create_ledger_header(1, b"k").unwrap();
        cache.set_location(1, 0, Location { log_id: 1, offset: 1 }).unwrap();
        let ok = cache
            .compare_and_swap_location(1, 0, Location { log_id: 1, offset: 1 }, Location { log_id: 7, offset: 7 })
            .unwrap();
        assert!(ok);
        assert_eq!(cache.get_location(1, 0).unwrap(), Location { log_id: 7, offset: 7 });
    }

    #[test]
    fn evicts_clean_pages_before_dirty_ones() {
        let cache = fixture(2);
        for ledger_id in [1, 2, 3] {
            cache.create_ledger_header(ledger_id, b"k").unwrap();
        }
        cache.set_location(1, 0, Location { log_id: 1, offset: 1 }).unwrap(); // page (1,0) dirty
        cache.flush_ledger(1).unwrap(); // now clean
        cache.get_location(2, 0).unwrap(); // page (2,0) clean, brings resident to 2
        cache.set_location(3, 0, Location { log_id: 3, offset: 3 }).unwrap(); // dirty, forces eviction
        assert!(cache.resident_pages() <= 2);
        // ledger 3's page must still be resident and correct regardless of eviction order
        assert_eq!(cache.get_location(3, 0).unwrap(), Location { log_id: 3, offset: 3 });
    }

    #[test]
    fn flush_ledger_leaves_a_page_mutated_during_flush_dirty() {
        let cache = fixture(8);
        cache.create_ledger_header(1, b"k").unwrap();
        cache.set_location(1, 0, Location { log_id: 1, offset: 1 }).unwrap();
        // simulate a concurrent writer landing between the flush's snapshot
        // and its version re-check by bumping the version out from under it
        {
            let mut inner = cache.inner.lock();
            let page = inner.pages.get_mut(&(1, 0)).unwrap();
            page.version += 1;
            page.data[1] = Location { log_id: 2, offset: 2 };
        }
        cache.flush_ledger(1).unwrap();
        // the page must still be dirty since its snapshot went stale mid-flush
        let inner = cache.inner.lock();
        assert!(inner.pages[&(1, 0)].dirty);
    }

    #[test]
    fn delete_ledger_drops_residency_and_unlinks_index() {
        let cache = fixture(8);
        cache.create_ledger_header(1, b"k").unwrap();
        cache.set_location(1, 0, Location { log_id: 1, offset: 1 }).unwrap();
        cache.flush_ledger(1).unwrap();
        cache.delete_ledger(1).unwrap();
        // re-reading synthesizes a fresh, all-absent page rather than the
        // stale on-disk data, since the index file was unlinked.
        assert!(cache.get_location(1, 0).unwrap().is_absent());
    }
}
