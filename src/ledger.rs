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

//! LedgerDescriptor / HandleFactory: per-ledger in-memory state and the
//! registry that hands out handles to it after verifying the caller's
//! master key.
//!
//! Follows the resource-registry idiom of `engine/fractal/mgr.rs`: a factory
//! owns a table of long-lived handles behind a lock and verifies a caller's
//! credentials before handing one out.

use crate::error::{BookieResult, Error, ErrorKind};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// The entry id a reader may pass to mean "the highest entry this ledger
/// has confirmed", but which is never a valid id to *write*.
pub const LAST_ADD_CONFIRMED: i64 = -1;

/// Per-ledger state held for as long as any handle to it is open.
pub struct LedgerDescriptor {
    pub ledger_id: i64,
    master_key: Vec<u8>,
    fenced: AtomicBool,
    /// serializes mutation of ledger-local bookkeeping (e.g. last-add-confirmed)
    mutate: Mutex<LedgerMeta>,
}

#[derive(Default)]
struct LedgerMeta {
    last_add_confirmed: i64,
}

impl LedgerDescriptor {
    pub fn new(ledger_id: i64, master_key: Vec<u8>) -> Self {
        Self {
            ledger_id,
            master_key,
            fenced: AtomicBool::new(false),
            mutate: Mutex::new(LedgerMeta {
                last_add_confirmed: LAST_ADD_CONFIRMED,
            }),
        }
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    pub fn set_fenced(&self) {
        self.fenced.store(true, Ordering::Release);
    }

    pub fn last_add_confirmed(&self) -> i64 {
        self.mutate.lock().last_add_confirmed
    }

    /// Reject a write against the `LAST_ADD_CONFIRMED` sentinel and against
    /// entries that don't advance monotonically; record the new high-water
    /// mark on success.
    pub fn authorize_write(&self, entry_id: i64, recovery: bool) -> BookieResult<()> {
        if entry_id == LAST_ADD_CONFIRMED {
            return Err(Error::new(
                ErrorKind::NoEntry,
                "entry id -1 is a read-only sentinel and cannot be written".to_string(),
            ));
        }
        if self.is_fenced() && !recovery {
            return Err(Error::with_kind(ErrorKind::LedgerFenced));
        }
        let mut meta = self.mutate.lock();
        if entry_id > meta.last_add_confirmed {
            meta.last_add_confirmed = entry_id;
        }
        Ok(())
    }

    fn verify_key(&self, master_key: &[u8]) -> BookieResult<()> {
        if master_key != self.master_key.as_slice() {
            return Err(Error::with_kind(ErrorKind::UnauthorizedAccess));
        }
        Ok(())
    }
}

/// Interning registry of [`LedgerDescriptor`]s, handing out `Arc` handles
/// after verifying the caller's master key (except for the explicitly
/// read-only path, which needs no key).
pub struct HandleFactory {
    ledgers: RwLock<HashMap<i64, Arc<LedgerDescriptor>>>,
}

impl Default for HandleFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleFactory {
    pub fn new() -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    /// Used during journal replay / recovery: register a ledger's
    /// descriptor directly, without a key check, since it's reconstructing
    /// already-authenticated on-disk state.
    pub fn install(&self, descriptor: Arc<LedgerDescriptor>) {
        self.ledgers.write().insert(descriptor.ledger_id, descriptor);
    }

    /// Create a brand-new ledger, failing if one already exists for this id.
    pub fn create(&self, ledger_id: i64, master_key: Vec<u8>) -> BookieResult<Arc<LedgerDescriptor>> {
        let mut ledgers = self.ledgers.write();
        if ledgers.contains_key(&ledger_id) {
            return Err(Error::new(
                ErrorKind::NoLedger,
                format!("ledger {ledger_id} already exists"),
            ));
        }
        let descriptor = Arc::new(LedgerDescriptor::new(ledger_id, master_key));
        ledgers.insert(ledger_id, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// A handle authorized for both reads and writes; requires the correct
    /// master key.
    pub fn get_handle(&self, ledger_id: i64, master_key: &[u8]) -> BookieResult<Arc<LedgerDescriptor>> {
        let descriptor = self.lookup(ledger_id)?;
        descriptor.verify_key(master_key)?;
        Ok(descriptor)
    }

    /// A handle authorized for reads only; no master key required.
    pub fn get_read_only_handle(&self, ledger_id: i64) -> BookieResult<Arc<LedgerDescriptor>> {
        self.lookup(ledger_id)
    }

    /// Same as [`Self::get_handle`], but on a miss falls back to `loader` to
    /// reconstruct the descriptor from persistent metadata (the ledger's
    /// index file header) rather than failing outright. Used once a
    /// ledger's one-time journal key record has been trimmed so its master
    /// key is no longer reachable by replay alone.
    pub fn get_handle_or_load(
        &self,
        ledger_id: i64,
        master_key: &[u8],
        loader: impl FnOnce() -> BookieResult<Option<(Vec<u8>, bool)>>,
    ) -> BookieResult<Arc<LedgerDescriptor>> {
        if let Ok(descriptor) = self.lookup(ledger_id) {
            descriptor.verify_key(master_key)?;
            return Ok(descriptor);
        }
        let descriptor = self.load_or_install(ledger_id, loader)?;
        descriptor.verify_key(master_key)?;
        Ok(descriptor)
    }

    /// Same as [`Self::get_read_only_handle`], but on a miss falls back to
    /// `loader` instead of failing; see [`Self::get_handle_or_load`].
    pub fn get_read_only_handle_or_load(
        &self,
        ledger_id: i64,
        loader: impl FnOnce() -> BookieResult<Option<(Vec<u8>, bool)>>,
    ) -> BookieResult<Arc<LedgerDescriptor>> {
        match self.lookup(ledger_id) {
            Ok(descriptor) => Ok(descriptor),
            Err(_) => self.load_or_install(ledger_id, loader),
        }
    }

    fn load_or_install(
        &self,
        ledger_id: i64,
        loader: impl FnOnce() -> BookieResult<Option<(Vec<u8>, bool)>>,
    ) -> BookieResult<Arc<LedgerDescriptor>> {
        let (master_key, fenced) = loader()?.ok_or_else(|| Error::with_kind(ErrorKind::NoLedger))?;
        let mut ledgers = self.ledgers.write();
        // a concurrent caller may have raced us between the lookup miss and
        // taking the write lock; keep whichever descriptor lands first.
        let descriptor = ledgers
            .entry(ledger_id)
            .or_insert_with(|| {
                let descriptor = Arc::new(LedgerDescriptor::new(ledger_id, master_key));
                if fenced {
                    descriptor.set_fenced();
                }
                descriptor
            })
            .clone();
        Ok(descriptor)
    }

    fn lookup(&self, ledger_id: i64) -> BookieResult<Arc<LedgerDescriptor>> {
        self.ledgers
            .read()
            .get(&ledger_id)
            .cloned()
            .ok_or_else(|| Error::with_kind(ErrorKind::NoLedger))
    }

    pub fn known_ledger_ids(&self) -> Vec<i64> {
        self.ledgers.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_handle_with_right_key_succeeds() {
        let factory = HandleFactory::new();
        factory.create(1, b"secret".to_vec()).unwrap();
        assert!(factory.get_handle(1, b"secret").is_ok());
    }

    #[test]
    fn wrong_key_is_unauthorized() {
        let factory = HandleFactory::new();
        factory.create(1, b"secret".to_vec()).unwrap();
        let err = factory.get_handle(1, b"nope").unwrap_err();
        assert!(err.is(ErrorKind::UnauthorizedAccess));
    }

    #[test]
    fn read_only_handle_needs_no_key() {
        let factory = HandleFactory::new();
        factory.create(1, b"secret".to_vec()).unwrap();
        assert!(factory.get_read_only_handle(1).is_ok());
    }

    #[test]
    fn unknown_ledger_is_no_ledger() {
        let factory = HandleFactory::new();
        let err = factory.get_handle(42, b"x").unwrap_err();
        assert!(err.is(ErrorKind::NoLedger));
    }

    #[test]
    fn get_handle_or_load_falls_back_to_loader_on_miss() {
        let factory = HandleFactory::new();
        let descriptor = factory
            .get_handle_or_load(7, b"secret", || Ok(Some((b"secret".to_vec(), false))))
            .unwrap();
        assert_eq!(descriptor.ledger_id, 7);
        assert!(!descriptor.is_fenced());
        // now resident in memory; a second call must not need the loader again
        let again = factory
            .get_handle_or_load(7, b"secret", || panic!("loader should not run twice"))
            .unwrap();
        assert_eq!(again.ledger_id, 7);
    }

    #[test]
    fn get_handle_or_load_propagates_loader_miss_as_no_ledger() {
        let factory = HandleFactory::new();
        let err = factory.get_handle_or_load(7, b"secret", || Ok(None)).unwrap_err();
        assert!(err.is(ErrorKind::NoLedger));
    }

    #[test]
    fn get_read_only_handle_or_load_restores_fenced_state() {
        let factory = HandleFactory::new();
        let descriptor = factory
            .get_read_only_handle_or_load(7, || Ok(Some((b"secret".to_vec(), true))))
            .unwrap();
        assert!(descriptor.is_fenced());
    }

    #[test]
    fn writing_sentinel_entry_id_is_rejected() {
        let descriptor = LedgerDescriptor::new(1, b"k".to_vec());
        let err = descriptor.authorize_write(LAST_ADD_CONFIRMED, false).unwrap_err();
        assert!(err.is(ErrorKind::NoEntry));
    }

    #[test]
    fn write_against_fenced_ledger_is_rejected_unless_recovery() {
        let descriptor = LedgerDescriptor::new(1, b"k".to_vec());
        descriptor.set_fenced();
        assert!(descriptor.authorize_write(0, false).is_err());
        assert!(descriptor.authorize_write(0, true).is_ok());
    }

    #[test]
    fn last_add_confirmed_advances_monotonically() {
        let descriptor = LedgerDescriptor::new(1, b"k".to_vec());
        descriptor.authorize_write(5, false).unwrap();
        descriptor.authorize_write(2, false).unwrap();
        assert_eq!(descriptor.last_add_confirmed(), 5);
    }
}
