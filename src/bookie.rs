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

//! The Bookie facade: owns every component, drives startup
//! (cookie check, replay, background tasks, metadata registration),
//! `add_entry`/`recovery_add_entry`/`read_entry`/`fence_ledger`, the
//! read-only transition, and idempotent shutdown.
//!
//! Follows the "owns all the components, orchestrates startup/shutdown"
//! shape of `engine/fractal/mgr.rs`.

use {
    crate::{
        cache::LedgerCache,
        config::BookieConfig,
        cookie::Cookie,
        dirs::{DirEvent, LedgerDirs},
        entrylog::EntryLog,
        error::{BookieResult, Error, ErrorKind},
        fs::{BookieFile, FsProvider},
        gc::{CompactionPolicy, GarbageCollector, LiveLedgerSet},
        index::{IndexFiles, Location},
        journal::{record::Record, Journal, LogMark},
        ledger::{HandleFactory, LAST_ADD_CONFIRMED},
        metadata::{MetadataClient, SessionId},
        sync::{LastLogMark, SyncThread},
    },
    bytes::Bytes,
    log::{error, info, warn},
    parking_lot::Mutex,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
};

/// Process exit codes. The embedding binary is responsible for
/// actually calling `std::process::exit` with the matching integer; this
/// crate only classifies *why* it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok,
    BookieException,
    ZkRegFail,
    ZkExpired,
    InvalidConf,
    InvalidCookie,
}

struct MetadataLiveLedgerSet<M: MetadataClient> {
    metadata: Arc<M>,
    root: String,
}

impl<M: MetadataClient> LiveLedgerSet for MetadataLiveLedgerSet<M> {
    fn is_live(&self, ledger_id: i64) -> bool {
        self.metadata.exists(&format!("{}/{ledger_id}", self.root))
    }
}

struct BackgroundTask {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

pub struct Bookie<F: FsProvider, M: MetadataClient> {
    fs: F,
    dirs: Arc<LedgerDirs<F>>,
    journal: Arc<Journal<F>>,
    entry_log: Arc<EntryLog<F>>,
    cache: Arc<LedgerCache<F>>,
    handles: Arc<HandleFactory>,
    metadata: Arc<M>,
    config: BookieConfig,
    bookie_id: String,
    session: SessionId,
    read_only: AtomicBool,
    shutdown: AtomicBool,
    sync_task: Mutex<Option<BackgroundTask>>,
    gc_task: Mutex<Option<BackgroundTask>>,
    dir_poll_task: Mutex<Option<BackgroundTask>>,
    gc: Mutex<Option<Arc<GarbageCollector<F, MetadataLiveLedgerSet<M>>>>>,
    sync_thread: Mutex<Option<Arc<SyncThread<F>>>>,
}

impl<F: FsProvider, M: MetadataClient> Bookie<F, M> {
    /// Run the full startup sequence and return a bookie
    /// ready to accept traffic.
    pub fn start(fs: F, config: BookieConfig, metadata: Arc<M>, bookie_id: impl Into<String>) -> BookieResult<Arc<Self>> {
        let bookie_id = bookie_id.into();
        let dirs = LedgerDirs::new(fs.clone(), config.ledger_dirs.clone(), config.ledger_dirs_low_space_threshold)?;

        Self::reconcile_cookie(&fs, &*metadata, &config, &dirs, &bookie_id)?;

        let last_mark = LastLogMark::read_majority(&fs, &dirs.all_dirs()).mark;

        let entry_log = Arc::new(EntryLog::open(fs.clone(), Arc::clone(&dirs), config.entry_log_max_segment_size)?);
        let index = IndexFiles::new(fs.clone(), Arc::clone(&dirs), config.index_entries_per_page);
        let cache = Arc::new(LedgerCache::new(Arc::new(index), config.ledger_cache_max_pages));
        let handles = Arc::new(HandleFactory::new());

        let replay_handles = Arc::clone(&handles);
        let replay_entry_log = Arc::clone(&entry_log);
        let replay_cache = Arc::clone(&cache);
        let (journal, report) = Journal::open(
            fs.clone(),
            config.journal_dir.clone(),
            config.journal_max_file_size,
            last_mark,
            config.journal_batch_max_records,
            config.journal_batch_max_delay,
            move |record, _mark, is_new| {
                Self::apply_replayed_record(&replay_handles, &replay_entry_log, &replay_cache, record, is_new)
            },
        )?;
        info!(
            "bookie {bookie_id} replay complete: {} record(s), torn_tail={}",
            report.records_applied, report.torn_tail
        );
        let journal = Arc::new(journal);

        let this = Arc::new(Self {
            fs,
            dirs: Arc::clone(&dirs),
            journal,
            entry_log,
            cache,
            handles,
            metadata: Arc::clone(&metadata),
            config,
            bookie_id: bookie_id.clone(),
            session: metadata.new_session(),
            read_only: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            sync_task: Mutex::new(None),
            gc_task: Mutex::new(None),
            dir_poll_task: Mutex::new(None),
            gc: Mutex::new(None),
            sync_thread: Mutex::new(None),
        });

        this.start_background_tasks();
        this.wire_disk_listener();
        this.register_available()?;
        Ok(this)
    }

    fn reconcile_cookie(fs: &F, metadata: &M, config: &BookieConfig, dirs: &Arc<LedgerDirs<F>>, bookie_id: &str) -> BookieResult<()> {
        let cookie_path = format!("{}/cookies/{bookie_id}", config.metadata_root);
        let computed = Cookie::new(bookie_id.to_string(), &config.ledger_dirs);
        let on_disk: Vec<(String, Option<Cookie>)> = dirs
            .all_dirs()
            .into_iter()
            .map(|dir| {
                let path = format!("{dir}/current/cookie");
                let cookie = fs
                    .open(&path)
                    .ok()
                    .and_then(|mut f| {
                        let len = f.len().ok()? as usize;
                        let mut buf = vec![0u8; len];
                        f.seek_from_start(0).ok()?;
                        f.read_exact(&mut buf).ok()?;
                        Cookie::decode(&buf)
                    });
                (dir, cookie)
            })
            .collect();

        let remote = metadata.read(&cookie_path)?.and_then(|bytes| Cookie::decode(&bytes));
        let any_on_disk = on_disk.iter().any(|(_, c)| c.is_some());

        if remote.is_none() && !any_on_disk {
            metadata.create_if_absent(&config.metadata_root, b"")?;
            metadata.write(&cookie_path, &computed.encode())?;
            for (dir, _) in &on_disk {
                fs.create_dir_all(&format!("{dir}/current"))?;
                let mut file = fs.open_or_create(&format!("{dir}/current/cookie"))?.into_inner();
                file.write_all(&computed.encode())?;
                file.sync_all()?;
            }
            return Ok(());
        }

        let expected = remote.unwrap_or_else(|| computed.clone());
        for (dir, cookie) in &on_disk {
            match cookie {
                Some(c) if *c == expected => {}
                Some(_) => {
                    return Err(Error::new(
                        ErrorKind::InvalidCookie,
                        format!("cookie mismatch in directory {dir}"),
                    ))
                }
                None => {
                    let mut file = fs.open_or_create(&format!("{dir}/current/cookie"))?.into_inner();
                    file.write_all(&expected.encode())?;
                    file.sync_all()?;
                }
            }
        }
        if remote.is_none() {
            metadata.write(&cookie_path, &expected.encode())?;
        }
        Ok(())
    }

    fn apply_replayed_record(
        handles: &HandleFactory,
        entry_log: &EntryLog<F>,
        cache: &LedgerCache<F>,
        record: Record,
        is_new: bool,
    ) -> BookieResult<()> {
        if record.is_ledger_key() {
            // also persist the key in the ledger's index header: the
            // journal record is only ever written once, and once the
            // journal rotates and a later checkpoint trims this file away
            // the header becomes the only durable copy.
            cache.create_ledger_header(record.ledger_id, &record.payload)?;
            if handles.get_read_only_handle(record.ledger_id).is_err() {
                handles.create(record.ledger_id, record.payload.clone())?;
            }
            return Ok(());
        }
        if record.is_fence() {
            let descriptor = handles
                .get_read_only_handle_or_load(record.ledger_id, || cache.read_ledger_header(record.ledger_id))
                .map_err(|_| {
                    Error::new(
                        ErrorKind::Corruption,
                        "fence record for unknown ledger (missing key record or index header)".to_string(),
                    )
                })?;
            descriptor.set_fenced();
            cache.set_ledger_fenced(record.ledger_id, true)?;
            return Ok(());
        }
        let descriptor = handles
            .get_read_only_handle_or_load(record.ledger_id, || cache.read_ledger_header(record.ledger_id))
            .map_err(|_| {
                Error::new(
                    ErrorKind::Corruption,
                    "entry record for unknown ledger (missing key record or index header)".to_string(),
                )
            })?;
        descriptor.authorize_write(record.entry_id, true)?;
        if is_new {
            let (log_id, offset) = entry_log.append(record.ledger_id, record.entry_id, &record.payload)?;
            cache.set_location(
                record.ledger_id,
                record.entry_id as u64,
                Location {
                    log_id: log_id as u32,
                    offset,
                },
            )?;
        }
        Ok(())
    }

    fn start_background_tasks(self: &Arc<Self>) {
        let sync_thread = Arc::new(SyncThread::new(
            self.fs.clone(),
            Arc::clone(&self.dirs),
            Arc::clone(&self.journal),
            Arc::clone(&self.entry_log),
            Arc::clone(&self.cache),
        ));
        let stop = sync_thread.stop_handle();
        let handle = Arc::clone(&sync_thread).spawn(self.config.checkpoint_interval);
        *self.sync_task.lock() = Some(BackgroundTask { stop, handle });
        *self.sync_thread.lock() = Some(sync_thread);

        let live = Arc::new(MetadataLiveLedgerSet {
            metadata: Arc::clone(&self.metadata),
            root: self.config.metadata_root.clone(),
        });
        let policy = CompactionPolicy {
            minor_ratio: self.config.gc_minor_compaction_ratio,
            minor_period: self.config.gc_minor_compaction_period,
            major_ratio: self.config.gc_major_compaction_ratio,
            major_period: self.config.gc_major_compaction_period,
        };
        let gc = Arc::new(GarbageCollector::new(Arc::clone(&self.entry_log), Arc::clone(&self.cache), live, policy));
        let stop = gc.stop_handle();
        let handle = Arc::clone(&gc).spawn(self.config.gc_scan_interval);
        *self.gc_task.lock() = Some(BackgroundTask { stop, handle });
        *self.gc.lock() = Some(gc);

        let stop = self.dirs.stop_handle();
        let handle = Arc::clone(&self.dirs).spawn_poller(self.config.dir_poll_interval);
        *self.dir_poll_task.lock() = Some(BackgroundTask { stop, handle });
    }

    /// Run one garbage-collection scan synchronously, bypassing the
    /// background interval. Useful for an operator-triggered compaction and
    /// for tests that want a deterministic point to assert GC's effects
    /// rather than waiting out `gc_scan_interval`.
    pub fn gc_scan_once(&self) -> BookieResult<crate::gc::GcReport> {
        match self.gc.lock().as_ref() {
            Some(gc) => gc.scan_once(),
            None => Ok(crate::gc::GcReport::default()),
        }
    }

    /// Hook the `allDisksFull` signal from [`LedgerDirs`] to the read-only
    /// transition.
    fn wire_disk_listener(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        self.dirs.on_event(move |event| {
            if let (DirEvent::AllDisksFull, Some(this)) = (event, this.upgrade()) {
                this.enter_read_only_or_shutdown();
            }
        });
    }

    fn enter_read_only_or_shutdown(self: &Arc<Self>) {
        if !self.config.read_only_on_disk_full {
            error!("bookie {}: all directories full and read-only transition disabled, shutting down", self.bookie_id);
            let _ = self.shutdown();
            return;
        }
        if self.read_only.swap(true, Ordering::AcqRel) {
            return; // already transitioned
        }
        warn!("bookie {}: all directories full, transitioning to read-only", self.bookie_id);
        let available_path = format!("{}/available/{}", self.bookies_root(), self.bookie_id);
        let readonly_root = format!("{}/readonly", self.bookies_root());
        let readonly_path = format!("{readonly_root}/{}", self.bookie_id);
        if let Err(e) = self.metadata.create_if_absent(&readonly_root, b"") {
            error!("failed to create readonly root znode: {e}");
        }
        if let Err(e) = self.metadata.create_ephemeral(&readonly_path, b"", self.session) {
            error!("failed to register read-only node: {e}");
        }
        let _ = self.metadata.delete(&available_path);
    }

    fn bookies_root(&self) -> String {
        format!("{}/bookies", self.config.metadata_root)
    }

    /// Register this bookie as available, first waiting for any stale
    /// ephemeral registration from a previous incarnation of this bookie id
    /// to disappear. Uses a fixed retry/backoff rather than a hardcoded
    /// timeout, since exact staleness semantics are cluster-tunable.
    fn register_available(&self) -> BookieResult<()> {
        let root = self.bookies_root();
        let available_root = format!("{root}/available");
        self.metadata.create_if_absent(&root, b"")?;
        self.metadata.create_if_absent(&available_root, b"")?;
        let path = format!("{available_root}/{}", self.bookie_id);
        const MAX_ATTEMPTS: u32 = 50;
        const BACKOFF: Duration = Duration::from_millis(100);
        for attempt in 0..MAX_ATTEMPTS {
            if !self.metadata.exists(&path) {
                break;
            }
            if attempt == MAX_ATTEMPTS - 1 {
                return Err(Error::new(
                    ErrorKind::Metadata,
                    "stale availability registration never expired".to_string(),
                ));
            }
            thread::sleep(BACKOFF);
        }
        self.metadata.create_ephemeral(&path, b"", self.session)?;
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn ensure_writable(&self) -> BookieResult<()> {
        if self.is_read_only() {
            return Err(Error::with_kind(ErrorKind::ReadOnly));
        }
        Ok(())
    }

    fn add_entry_inner(&self, ledger_id: i64, entry_id: i64, payload: &[u8], master_key: &[u8], recovery: bool) -> BookieResult<()> {
        if !recovery {
            self.ensure_writable()?;
        }
        let descriptor = match self
            .handles
            .get_handle_or_load(ledger_id, master_key, || self.cache.read_ledger_header(ledger_id))
        {
            Ok(d) => d,
            Err(e) if e.is(ErrorKind::NoLedger) => {
                let d = self.handles.create(ledger_id, master_key.to_vec())?;
                self.cache.create_ledger_header(ledger_id, master_key)?;
                self.journal.append(&Record::ledger_key(ledger_id, master_key.to_vec()))?;
                d
            }
            Err(e) => return Err(e),
        };
        descriptor.authorize_write(entry_id, recovery)?;
        let (log_id, offset) = self.entry_log.append(ledger_id, entry_id, payload)?;
        self.cache.set_location(
            ledger_id,
            entry_id as u64,
            Location {
                log_id: log_id as u32,
                offset,
            },
        )?;
        self.journal.append(&Record::entry(ledger_id, entry_id, payload.to_vec()))?;
        Ok(())
    }

    pub fn add_entry(&self, ledger_id: i64, entry_id: i64, payload: &[u8], master_key: &[u8]) -> BookieResult<()> {
        self.add_entry_inner(ledger_id, entry_id, payload, master_key, false)
    }

    /// Same as [`Self::add_entry`] but skips the fenced check, for
    /// client-driven ledger recovery.
    pub fn recovery_add_entry(&self, ledger_id: i64, entry_id: i64, payload: &[u8], master_key: &[u8]) -> BookieResult<()> {
        self.add_entry_inner(ledger_id, entry_id, payload, master_key, true)
    }

    pub fn read_entry(&self, ledger_id: i64, entry_id: i64) -> BookieResult<Bytes> {
        let descriptor = self
            .handles
            .get_read_only_handle_or_load(ledger_id, || self.cache.read_ledger_header(ledger_id))?;
        let resolved_entry_id = if entry_id == LAST_ADD_CONFIRMED {
            let last = descriptor.last_add_confirmed();
            if last == LAST_ADD_CONFIRMED {
                return Err(Error::with_kind(ErrorKind::NoEntry));
            }
            last
        } else {
            entry_id
        };
        let loc = self.cache.get_location(ledger_id, resolved_entry_id as u64)?;
        if loc.is_absent() {
            return Err(Error::with_kind(ErrorKind::NoEntry));
        }
        self.entry_log.read_at(loc.log_id as u64, loc.offset, ledger_id, resolved_entry_id)
    }

    /// Fence a ledger, returning a future/promise-style handle that resolves
    /// once the fence record is durable, rather than a callback+latch pair.
    /// The journal append beneath it already blocks
    /// for the fsync, so the channel always resolves before this call
    /// returns; callers that want to await it anyway (e.g. across an async
    /// boundary) still get a consistent handle type.
    pub fn fence_ledger(&self, ledger_id: i64, master_key: &[u8]) -> BookieResult<tokio::sync::oneshot::Receiver<BookieResult<()>>> {
        let descriptor = self
            .handles
            .get_handle_or_load(ledger_id, master_key, || self.cache.read_ledger_header(ledger_id))?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        if !descriptor.is_fenced() {
            descriptor.set_fenced();
            // persist the fence in the index header before the journal
            // record, so it's durable independent of when that record's
            // journal file eventually gets trimmed.
            self.cache.set_ledger_fenced(ledger_id, true)?;
            let result = self.journal.append(&Record::fence(ledger_id)).map(|_| ());
            let _ = tx.send(result);
        } else {
            let _ = tx.send(Ok(()));
        }
        Ok(rx)
    }

    /// Idempotent shutdown: stop accepting writes, join background tasks,
    /// flush every durable layer, leave the metadata session.
    pub fn shutdown(&self) -> BookieResult<ExitCode> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(ExitCode::Ok);
        }
        info!("bookie {} shutting down", self.bookie_id);
        // run one last checkpoint synchronously before tearing down the
        // background sync thread, so LastLogMark advances past everything
        // acknowledged before shutdown instead of waiting on a tick that may
        // never come.
        if let Some(sync_thread) = self.sync_thread.lock().as_ref() {
            match sync_thread.checkpoint_once() {
                Ok(mark) => info!("bookie {} final checkpoint at {:?}", self.bookie_id, mark.mark),
                Err(e) => error!("bookie {} final checkpoint failed: {e}", self.bookie_id),
            }
        }
        if let Some(task) = self.sync_task.lock().take() {
            task.stop.store(true, Ordering::Release);
            let _ = task.handle.join();
        }
        if let Some(task) = self.gc_task.lock().take() {
            task.stop.store(true, Ordering::Release);
            let _ = task.handle.join();
        }
        if let Some(task) = self.dir_poll_task.lock().take() {
            task.stop.store(true, Ordering::Release);
            let _ = task.handle.join();
        }
        // belt-and-suspenders: flush again in case a write raced the final
        // checkpoint above between its flush and this shutdown call.
        self.cache.flush_all()?;
        self.entry_log.flush()?;
        let available_path = format!("{}/available/{}", self.bookies_root(), self.bookie_id);
        let _ = self.metadata.delete(&available_path);
        self.metadata.expire_session(self.session);
        Ok(ExitCode::Ok)
    }
}
