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

//! The write-ahead journal: a single-writer append stream, batched into
//! group commits and rotated into numbered files so old ones can be trimmed
//! once every ledger they cover is durable in the entry log and index.
//!
//! Follows the shape of `engine/storage/v2/raw/journal/raw/mod.rs`
//! (append-only framed log with a scan-on-open recovery pass), generalized
//! with this crate's own concrete [`record::Record`] framing in place of
//! that file's generic `RawJournalAdapter` trait — Bookie has exactly one
//! record shape, so the adapter abstraction (and its `TaggedEnum`
//! proc-macro support) buys nothing here.

pub mod record;

use {
    crate::{
        error::{BookieResult, Error, ErrorKind},
        fs::{BookieFile, FsProvider},
    },
    log::{info, warn},
    parking_lot::Mutex,
    record::{DecodeOutcome, Record},
    std::{
        sync::{mpsc, Arc},
        thread,
        time::{Duration, Instant},
    },
};

/// A position in the journal stream: which rotated file, and the byte offset
/// within it immediately after the last record written there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogMark {
    pub file_id: u64,
    pub offset: u64,
}

impl LogMark {
    pub const ZERO: LogMark = LogMark { file_id: 0, offset: 0 };
}

/// Statistics from a single [`Journal::replay`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub records_applied: u64,
    pub bytes_applied: u64,
    /// set when replay stopped early on a torn tail rather than running out
    /// of journal files to read
    pub torn_tail: bool,
}

struct WriterState<F: FsProvider> {
    file: F::File,
    file_id: u64,
    size: u64,
}

/// The part of the journal a background writer thread needs: the file
/// handle and the rotation policy, but none of the group-commit queueing.
/// Split out so [`Journal::open`]'s writer thread can hold its own `Arc`
/// without also owning the queue it's draining.
struct JournalCore<F: FsProvider> {
    fs: F,
    dir: String,
    max_file_size: u64,
    writer: Mutex<WriterState<F>>,
}

impl<F: FsProvider> JournalCore<F> {
    /// Append a batch of records as one group commit: all records are
    /// written then a single `sync_all` makes the whole batch durable
    /// together.
    fn write_batch(&self, records: &[Record]) -> BookieResult<LogMark> {
        if records.is_empty() {
            let writer = self.writer.lock();
            return Ok(LogMark {
                file_id: writer.file_id,
                offset: writer.size,
            });
        }
        let mut buf = Vec::new();
        for record in records {
            record.encode_into(&mut buf);
        }
        let mut writer = self.writer.lock();
        if writer.size > 0 && writer.size + buf.len() as u64 > self.max_file_size {
            self.rotate(&mut writer)?;
        }
        writer.file.write_all(&buf)?;
        writer.file.sync_all()?;
        writer.size += buf.len() as u64;
        Ok(LogMark {
            file_id: writer.file_id,
            offset: writer.size,
        })
    }

    fn rotate(&self, writer: &mut WriterState<F>) -> BookieResult<()> {
        writer.file.sync_all()?;
        let next_id = writer.file_id + 1;
        let file = self.fs.open_or_create(&file_name(&self.dir, next_id))?.into_inner();
        info!("rotating journal {} -> file {next_id}", self.dir);
        writer.file = file;
        writer.file_id = next_id;
        writer.size = 0;
        Ok(())
    }

    fn current_mark(&self) -> LogMark {
        let writer = self.writer.lock();
        LogMark {
            file_id: writer.file_id,
            offset: writer.size,
        }
    }

    /// Delete every whole journal file strictly older than `mark.file_id`.
    /// Never deletes the file currently being written to, and never deletes
    /// partial files — only ones entirely covered by an advanced checkpoint.
    fn trim_to(&self, mark: LogMark) -> BookieResult<u64> {
        let mut removed = 0;
        let current_id = self.writer.lock().file_id;
        for id in Journal::<F>::list_file_ids(&self.fs, &self.dir)? {
            if id < mark.file_id && id != current_id {
                self.fs.remove_file(&file_name(&self.dir, id))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// A pending single-record append, waiting for the writer thread to fold it
/// into the next group commit.
struct PendingAppend {
    record: Record,
    reply: mpsc::Sender<BookieResult<LogMark>>,
}

/// A single-writer append stream. `append` hands a record to a dedicated
/// writer thread over a channel and blocks until that thread's next group
/// commit durably includes it — concurrent callers queued up behind the
/// same in-flight batch share its one `fsync`, rather than each paying for
/// their own.
pub struct Journal<F: FsProvider> {
    core: Arc<JournalCore<F>>,
    queue_tx: Mutex<Option<mpsc::Sender<PendingAppend>>>,
    writer_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

fn file_name(dir: &str, id: u64) -> String {
    format!("{dir}/{id}.txn")
}

impl<F: FsProvider> Journal<F> {
    /// Open (creating if absent) the journal in `dir`, replaying every
    /// record in file order. Returns the opened journal positioned for new
    /// appends, plus a report of what replay saw.
    ///
    /// `on_record` is called for every record ever written, not just those
    /// after `from_mark` — ledger metadata (master key, fenced state) is
    /// only ever recorded once and must be rebuilt regardless of where the
    /// last checkpoint landed. Its third argument is `true` once the
    /// record's position exceeds `from_mark`: records at or before it are
    /// already reflected in the entry log and index per `LastLogMark`'s
    /// contract, so callers should apply metadata but skip re-appending
    /// entry payloads for them.
    pub fn open(
        fs: F,
        dir: impl Into<String>,
        max_file_size: u64,
        from_mark: LogMark,
        batch_max_records: usize,
        batch_max_delay: Duration,
        mut on_record: impl FnMut(Record, LogMark, bool) -> BookieResult<()>,
    ) -> BookieResult<(Self, ReplayReport)> {
        let dir = dir.into();
        fs.create_dir_all(&dir)?;
        let mut file_ids = Self::list_file_ids(&fs, &dir)?;
        file_ids.sort_unstable();

        let mut report = ReplayReport::default();
        let mut last_id = 0u64;
        for &id in &file_ids {
            let mut file = fs.open(&file_name(&dir, id))?;
            let len = file.len()?;
            let mut buf = vec![0u8; len as usize];
            file.seek_from_start(0)?;
            file.read_exact(&mut buf)?;
            let mut pos = 0usize;
            loop {
                match Record::decode(&buf[pos..]) {
                    DecodeOutcome::Ok(record, consumed) => {
                        pos += consumed;
                        report.records_applied += 1;
                        report.bytes_applied += consumed as u64;
                        let mark = LogMark {
                            file_id: id,
                            offset: pos as u64,
                        };
                        let is_new = mark > from_mark;
                        on_record(record, mark, is_new)?;
                    }
                    DecodeOutcome::Incomplete => {
                        if pos < buf.len() {
                            report.torn_tail = true;
                            warn!(
                                "journal file {} has a torn tail at offset {pos}, truncating",
                                file_name(&dir, id)
                            );
                        }
                        break;
                    }
                    DecodeOutcome::Corrupt => {
                        return Err(Error::new(
                            ErrorKind::Corruption,
                            format!("interior corruption in journal file {} at offset {pos}", file_name(&dir, id)),
                        ));
                    }
                }
            }
            last_id = id;
        }

        let (file, size, file_id) = if file_ids.is_empty() {
            let file = fs.open_or_create(&file_name(&dir, 0))?.into_inner();
            (file, 0, 0)
        } else {
            let mut file = fs.open(&file_name(&dir, last_id))?;
            // truncate away any torn tail so future appends start clean
            let truncate_to = Self::live_len_of_last_file(&fs, &dir, last_id)?;
            file.truncate(truncate_to)?;
            file.seek_from_start(truncate_to)?;
            (file, truncate_to, last_id)
        };

        info!(
            "journal {dir} opened: {} record(s) replayed, torn_tail={}",
            report.records_applied, report.torn_tail
        );

        let core = Arc::new(JournalCore {
            fs,
            dir,
            max_file_size,
            writer: Mutex::new(WriterState { file, file_id, size }),
        });

        let (queue_tx, queue_rx) = mpsc::channel::<PendingAppend>();
        let batch_max_records = batch_max_records.max(1);
        let worker_core = Arc::clone(&core);
        let writer_thread = thread::Builder::new()
            .name(format!("bookie-journal-writer-{}", core.dir))
            .spawn(move || Self::writer_loop(worker_core, queue_rx, batch_max_records, batch_max_delay))
            .map_err(|e| Error::new(ErrorKind::Io, format!("failed to spawn journal writer thread: {e}")))?;

        Ok((
            Self {
                core,
                queue_tx: Mutex::new(Some(queue_tx)),
                writer_thread: Mutex::new(Some(writer_thread)),
            },
            report,
        ))
    }

    /// Group-commit loop: block for the first queued record, then keep
    /// folding in whatever else arrives until the batch hits
    /// `batch_max_records` or `batch_max_delay` elapses since the first
    /// record in the batch, whichever comes first. One `write_batch` call
    /// (one `fsync`) serves the whole batch; every caller queued behind it
    /// gets the same result.
    fn writer_loop(
        core: Arc<JournalCore<F>>,
        queue_rx: mpsc::Receiver<PendingAppend>,
        batch_max_records: usize,
        batch_max_delay: Duration,
    ) {
        while let Ok(first) = queue_rx.recv() {
            let mut batch = vec![first];
            let deadline = Instant::now() + batch_max_delay;
            while batch.len() < batch_max_records {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match queue_rx.recv_timeout(deadline - now) {
                    Ok(pending) => batch.push(pending),
                    Err(_) => break,
                }
            }
            let records: Vec<Record> = batch.iter().map(|p| p.record.clone()).collect();
            let result = core.write_batch(&records);
            for pending in batch {
                let _ = pending.reply.send(result.clone());
            }
        }
        // every Sender (the one Journal keeps plus any in-flight append()
        // callers' clones) has been dropped: the journal is shutting down.
    }

    fn list_file_ids(fs: &F, dir: &str) -> BookieResult<Vec<u64>> {
        let mut ids = vec![];
        for name in fs.read_dir(dir).unwrap_or_default() {
            if let Some(stem) = name.strip_suffix(".txn") {
                if let Ok(id) = stem.parse() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Re-derive how many live bytes the last journal file holds by
    /// replaying it again in isolation, so `open` can truncate away a torn
    /// tail without having tracked per-file byte counts through the merged
    /// replay loop above.
    fn live_len_of_last_file(fs: &F, dir: &str, last_id: u64) -> BookieResult<u64> {
        let mut file = fs.open(&file_name(dir, last_id))?;
        let len = file.len()?;
        let mut buf = vec![0u8; len as usize];
        file.seek_from_start(0)?;
        file.read_exact(&mut buf)?;
        let mut pos = 0usize;
        loop {
            match Record::decode(&buf[pos..]) {
                DecodeOutcome::Ok(_, consumed) => pos += consumed,
                _ => break,
            }
        }
        Ok(pos as u64)
    }

    /// Append a whole batch directly, bypassing the group-commit queue: one
    /// `write_batch` call, one `fsync`, for records the caller has already
    /// assembled. Nothing in this crate calls this directly today — `append`
    /// is the only path handler threads use — but it's kept as the
    /// low-level primitive the writer thread itself is built on, and as an
    /// escape hatch for a caller that already holds a ready-made batch.
    pub fn append_batch(&self, records: &[Record]) -> BookieResult<LogMark> {
        self.core.write_batch(records)
    }

    /// Enqueue a single record and block until the writer thread's group
    /// commit that includes it has fsynced. Concurrent callers queued
    /// behind the same in-flight batch share its one `fsync`.
    pub fn append(&self, record: &Record) -> BookieResult<LogMark> {
        let tx = {
            let guard = self.queue_tx.lock();
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(Error::new(ErrorKind::Io, "journal writer has already shut down")),
            }
        };
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(PendingAppend {
            record: record.clone(),
            reply: reply_tx,
        })
        .map_err(|_| Error::new(ErrorKind::Io, "journal writer thread is not running"))?;
        reply_rx
            .recv()
            .map_err(|_| Error::new(ErrorKind::Io, "journal writer thread dropped without replying"))?
    }

    pub fn current_mark(&self) -> LogMark {
        self.core.current_mark()
    }

    /// Delete every whole journal file strictly older than `mark.file_id`.
    /// Never deletes the file currently being written to, and never deletes
    /// partial files — only ones entirely covered by an advanced checkpoint.
    pub fn trim_to(&self, mark: LogMark) -> BookieResult<u64> {
        self.core.trim_to(mark)
    }
}

impl<F: FsProvider> Drop for Journal<F> {
    fn drop(&mut self) {
        // dropping the last `Sender` (this one, plus any `append()` call
        // that's still in flight) makes the writer thread's `recv()` return
        // `Err`, ending its loop; join it so the thread never outlives the
        // journal it writes to.
        self.queue_tx.lock().take();
        if let Some(handle) = self.writer_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
