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

//! LedgerDirs: the pool of configured data directories.
//!
//! Tracks which directories are currently writable, biases new-file placement
//! towards the directory with the most free space, and polls disk health on a
//! background interval so a dying disk is noticed before a write fails on it.

use {
    crate::{
        error::{BookieResult, Error, ErrorKind},
        fs::FsProvider,
    },
    log::{info, warn},
    parking_lot::RwLock,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
};

/// Events the background poller delivers to interested listeners. Follows
/// the single-value "poll a fact, publish it" shape of `util/os/free_memory.rs`,
/// generalized here to a multi-directory set with an explicit event enum
/// instead of one global gauge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEvent {
    DiskFull(String),
    DiskFailed(String),
    AllDisksFull,
    FatalError(String),
}

struct DirState<F: FsProvider> {
    path: String,
    writable: AtomicBool,
    /// released (and the advisory lock dropped) when this `LedgerDirs` is
    /// dropped, so a crashed process never leaves a stale lock a restart
    /// can't clear
    #[allow(dead_code)]
    lock: F::DirLock,
}

pub struct LedgerDirs<F: FsProvider> {
    fs: F,
    dirs: Vec<Arc<DirState<F>>>,
    rr_cursor: std::sync::atomic::AtomicUsize,
    listeners: RwLock<Vec<Box<dyn Fn(DirEvent) + Send + Sync>>>,
    low_space_threshold: u64,
    stop: Arc<AtomicBool>,
}

impl<F: FsProvider> LedgerDirs<F> {
    pub fn new(fs: F, paths: Vec<String>, low_space_threshold: u64) -> BookieResult<Arc<Self>> {
        if paths.is_empty() {
            return Err(Error::new(
                ErrorKind::NoWritableDir,
                "no ledger directories configured".to_string(),
            ));
        }
        let mut dirs = Vec::with_capacity(paths.len());
        for path in &paths {
            fs.create_dir_all(&format!("{path}/current"))?;
            let lock = fs.lock_dir(&format!("{path}/current"))?;
            dirs.push(Arc::new(DirState {
                path: path.clone(),
                writable: AtomicBool::new(true),
                lock,
            }));
        }
        Ok(Arc::new(Self {
            fs,
            dirs,
            rr_cursor: std::sync::atomic::AtomicUsize::new(0),
            listeners: RwLock::new(Vec::new()),
            low_space_threshold,
            stop: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn on_event(&self, listener: impl Fn(DirEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    fn emit(&self, event: DirEvent) {
        for listener in self.listeners.read().iter() {
            listener(event.clone());
        }
    }

    pub fn all_dirs(&self) -> Vec<String> {
        self.dirs.iter().map(|d| d.path.clone()).collect()
    }

    pub fn writable_dirs(&self) -> Vec<String> {
        self.dirs
            .iter()
            .filter(|d| d.writable.load(Ordering::Acquire))
            .map(|d| d.path.clone())
            .collect()
    }

    fn mark_full(&self, dir: &Arc<DirState<F>>) {
        if dir.writable.swap(false, Ordering::AcqRel) {
            warn!("ledger directory {} is full, marking unwritable", dir.path);
            self.emit(DirEvent::DiskFull(dir.path.clone()));
            if self.writable_dirs().is_empty() {
                self.emit(DirEvent::AllDisksFull);
            }
        }
    }

    fn mark_failed(&self, dir: &Arc<DirState<F>>, detail: &str) {
        if dir.writable.swap(false, Ordering::AcqRel) {
            warn!("ledger directory {} failed: {detail}", dir.path);
            self.emit(DirEvent::DiskFailed(dir.path.clone()));
            if self.writable_dirs().is_empty() {
                self.emit(DirEvent::AllDisksFull);
            }
        }
    }

    /// Round-robin among writable directories, biased towards whichever of
    /// the next two candidates has more free space — enough to avoid
    /// funneling every new file onto one disk without the bookkeeping of a
    /// full best-of-N scan on every call.
    pub fn pick_for_new_file(&self) -> BookieResult<String> {
        let writable: Vec<&Arc<DirState<F>>> = self
            .dirs
            .iter()
            .filter(|d| d.writable.load(Ordering::Acquire))
            .collect();
        if writable.is_empty() {
            return Err(Error::with_kind(ErrorKind::NoWritableDir));
        }
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % writable.len();
        let a = writable[start];
        let b = writable[(start + 1) % writable.len()];
        if Arc::ptr_eq(a, b) {
            return Ok(a.path.clone());
        }
        let space_a = self.fs.free_space(&a.path).unwrap_or(0);
        let space_b = self.fs.free_space(&b.path).unwrap_or(0);
        Ok(if space_b > space_a { b.path.clone() } else { a.path.clone() })
    }

    /// Poll every directory once: update writability from free space and
    /// from a lock-acquire probe. Called by [`Self::spawn_poller`] on an
    /// interval and directly by callers after an I/O failure.
    pub fn poll_once(&self) {
        for dir in &self.dirs {
            match self.fs.free_space(&dir.path) {
                Ok(space) if space < self.low_space_threshold => self.mark_full(dir),
                Ok(_) => {
                    if !dir.writable.load(Ordering::Acquire) {
                        info!("ledger directory {} has free space again", dir.path);
                        dir.writable.store(true, Ordering::Release);
                    }
                }
                Err(e) => self.mark_failed(dir, &e.to_string()),
            }
        }
    }

    pub fn report_io_error(&self, path: &str, detail: &str) {
        if let Some(dir) = self.dirs.iter().find(|d| d.path == path) {
            self.mark_failed(dir, detail);
        }
    }

    /// Spawn the dedicated background poller thread, following
    /// `util/os/free_memory.rs`'s pattern of a detached polling loop. Runs
    /// until [`Self::stop_handle`] is set, matching the shutdown idiom
    /// [`crate::sync::SyncThread`] and
    /// [`crate::gc::GarbageCollector`] use for their own background tasks.
    pub fn spawn_poller(self: Arc<Self>, interval: Duration) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("bookie-dirs-poll".into())
            .spawn(move || {
                while !self.stop.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if self.stop.load(Ordering::Acquire) {
                        return;
                    }
                    self.poll_once();
                }
            })
            .expect("failed to spawn ledger-dirs poller thread")
    }
}
