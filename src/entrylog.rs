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

//! EntryLog: the segmented, append-only store for entry payloads. Every
//! ledger's entries interleave into the same rolling set of segment files;
//! callers address a written entry by the `(log_id, offset)` pair `append`
//! hands back, never by path.
//!
//! Framing per record: `[len: u32][ledger_id: i64][entry_id: i64][payload]`.
//! No checksum here — the journal already guarantees durability and
//! integrity for anything not yet reflected in the entry log; the entry log
//! only needs to be byte-addressable and to carry enough of a trailer for
//! the garbage collector to know which ledgers a sealed segment covers.

use {
    crate::{
        dirs::LedgerDirs,
        error::{BookieResult, Error, ErrorKind},
        fs::{BookieFile, FsProvider},
    },
    bytes::Bytes,
    log::info,
    parking_lot::Mutex,
    std::{collections::HashSet, sync::Arc},
};

const HEADER_LEN: usize = 4 + 8 + 8;

fn segment_name(dir: &str, log_id: u64) -> String {
    format!("{dir}/{log_id}.log")
}

fn ledger_index_name(dir: &str, log_id: u64) -> String {
    format!("{dir}/{log_id}.ledgers")
}

fn encode_ledger_index(ledgers: &HashSet<i64>) -> Vec<u8> {
    let mut sorted: Vec<i64> = ledgers.iter().copied().collect();
    sorted.sort_unstable();
    let mut buf = Vec::with_capacity(sorted.len() * 8);
    for id in sorted {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf
}

fn decode_ledger_index(buf: &[u8]) -> Vec<i64> {
    buf.chunks_exact(8)
        .map(|c| i64::from_be_bytes(c.try_into().unwrap()))
        .collect()
}

struct WriterState<F: FsProvider> {
    file: F::File,
    log_id: u64,
    size: u64,
    /// ledgers appended to in the currently-open segment; written as a
    /// trailer when the segment seals, so GC can tell at a glance which
    /// segments are candidates for a given ledger without scanning payloads.
    ledgers_in_segment: HashSet<i64>,
}

pub struct EntryLog<F: FsProvider> {
    fs: F,
    dirs: Arc<LedgerDirs<F>>,
    max_segment_size: u64,
    writer: Mutex<WriterState<F>>,
}

impl<F: FsProvider> EntryLog<F> {
    pub fn open(fs: F, dirs: Arc<LedgerDirs<F>>, max_segment_size: u64) -> BookieResult<Self> {
        let mut max_id = 0u64;
        let mut found_any = false;
        for dir in dirs.all_dirs() {
            for name in fs.read_dir(&format!("{dir}/current")).unwrap_or_default() {
                if let Some(id) = name.strip_suffix(".log").and_then(|s| s.parse::<u64>().ok()) {
                    found_any = true;
                    max_id = max_id.max(id);
                }
            }
        }
        let log_id = if found_any { max_id } else { 0 };
        let placement = dirs.pick_for_new_file()?;
        let path = segment_name(&format!("{placement}/current"), log_id);
        let mut file = fs.open_or_create(&path)?.into_inner();
        let size = file.len()?;
        file.seek_from_start(size)?;
        Ok(Self {
            fs,
            dirs,
            max_segment_size,
            writer: Mutex::new(WriterState {
                file,
                log_id,
                size,
                ledgers_in_segment: HashSet::new(),
            }),
        })
    }

    /// Append `payload` for `(ledger_id, entry_id)`, returning the
    /// `(log_id, offset)` pair that addresses it. `offset` points at the
    /// start of the record, not the payload, so a reader can re-derive
    /// `ledger_id`/`entry_id` as a sanity check.
    pub fn append(&self, ledger_id: i64, entry_id: i64, payload: &[u8]) -> BookieResult<(u64, u64)> {
        let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
        record.extend_from_slice(&((HEADER_LEN - 4 + payload.len()) as u32).to_be_bytes());
        record.extend_from_slice(&ledger_id.to_be_bytes());
        record.extend_from_slice(&entry_id.to_be_bytes());
        record.extend_from_slice(payload);

        let mut writer = self.writer.lock();
        if writer.size > 0 && writer.size + record.len() as u64 > self.max_segment_size {
            self.seal_and_rotate(&mut writer)?;
        }
        let offset = writer.size;
        writer.file.write_all(&record)?;
        writer.file.flush()?;
        writer.size += record.len() as u64;
        writer.ledgers_in_segment.insert(ledger_id);
        Ok((writer.log_id, offset))
    }

    /// Force buffered writes for the current segment to stable storage.
    /// Called by the sync thread on its checkpoint interval.
    pub fn flush(&self) -> BookieResult<()> {
        self.writer.lock().file.sync_all()
    }

    fn seal_and_rotate(&self, writer: &mut WriterState<F>) -> BookieResult<()> {
        writer.file.sync_all()?;
        self.persist_ledger_index(writer.log_id, &writer.ledgers_in_segment)?;
        info!("sealing entry log segment {}", writer.log_id);
        let next_id = writer.log_id + 1;
        let placement = self.dirs.pick_for_new_file()?;
        let path = segment_name(&format!("{placement}/current"), next_id);
        let file = self.fs.open_or_create(&path)?.into_inner();
        writer.file = file;
        writer.log_id = next_id;
        writer.size = 0;
        writer.ledgers_in_segment.clear();
        Ok(())
    }

    fn persist_ledger_index(&self, log_id: u64, ledgers: &HashSet<i64>) -> BookieResult<()> {
        let dir = self.segment_dir(log_id)?;
        let path = ledger_index_name(&format!("{dir}/current"), log_id);
        let mut file = self.fs.open_or_create(&path)?.into_inner();
        file.write_all(&encode_ledger_index(ledgers))?;
        file.sync_all()
    }

    fn segment_dir(&self, log_id: u64) -> BookieResult<String> {
        self.dirs
            .all_dirs()
            .into_iter()
            .find(|dir| self.fs.exists(&segment_name(&format!("{dir}/current"), log_id)))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Io,
                    format!("entry log segment {log_id} not found in any configured directory"),
                )
            })
    }

    /// Every sealed segment's `log_id`, in ascending order — the current,
    /// still-open segment is never included since it has no ledger-index
    /// sidecar yet.
    pub fn sealed_segments(&self) -> BookieResult<Vec<u64>> {
        let current = self.writer.lock().log_id;
        let mut ids = std::collections::HashSet::new();
        for dir in self.dirs.all_dirs() {
            for name in self.fs.read_dir(&format!("{dir}/current")).unwrap_or_default() {
                if let Some(id) = name.strip_suffix(".ledgers").and_then(|s| s.parse::<u64>().ok()) {
                    if id != current {
                        ids.insert(id);
                    }
                }
            }
        }
        let mut ids: Vec<u64> = ids.into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// The set of ledger ids a sealed segment contains, read from its
    /// persisted sidecar without scanning entry payloads.
    pub fn segment_ledgers(&self, log_id: u64) -> BookieResult<Vec<i64>> {
        let dir = self.segment_dir(log_id)?;
        let path = ledger_index_name(&format!("{dir}/current"), log_id);
        let mut file = self.fs.open(&path)?;
        let len = file.len()?;
        let mut buf = vec![0u8; len as usize];
        file.seek_from_start(0)?;
        file.read_exact(&mut buf)?;
        Ok(decode_ledger_index(&buf))
    }

    /// Every `(ledger_id, entry_id, offset, payload)` record stored in
    /// `log_id`, read in file order. Used by the compactor to rewrite a
    /// segment's live entries elsewhere.
    pub fn scan_segment(&self, log_id: u64) -> BookieResult<Vec<(i64, i64, u64, Bytes)>> {
        let dir = self.segment_dir(log_id)?;
        let mut file = self.fs.open(&segment_name(&format!("{dir}/current"), log_id))?;
        let len = file.len()?;
        let mut buf = vec![0u8; len as usize];
        file.seek_from_start(0)?;
        file.read_exact(&mut buf)?;
        let mut out = vec![];
        let mut pos = 0usize;
        while pos + HEADER_LEN <= buf.len() {
            let body_len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let ledger_id = i64::from_be_bytes(buf[pos + 4..pos + 12].try_into().unwrap());
            let entry_id = i64::from_be_bytes(buf[pos + 12..pos + 20].try_into().unwrap());
            let payload_start = pos + HEADER_LEN;
            let payload_len = body_len - (HEADER_LEN - 4);
            if payload_start + payload_len > buf.len() {
                break;
            }
            let payload = Bytes::copy_from_slice(&buf[payload_start..payload_start + payload_len]);
            out.push((ledger_id, entry_id, pos as u64, payload));
            pos = payload_start + payload_len;
        }
        Ok(out)
    }

    /// Delete a sealed segment and its ledger-index sidecar. Callers must
    /// ensure no ledger listed in it is still live in the metadata service.
    pub fn delete_segment(&self, log_id: u64) -> BookieResult<()> {
        let dir = self.segment_dir(log_id)?;
        self.fs.remove_file(&segment_name(&format!("{dir}/current"), log_id))?;
        let sidecar = ledger_index_name(&format!("{dir}/current"), log_id);
        if self.fs.exists(&sidecar) {
            self.fs.remove_file(&sidecar)?;
        }
        Ok(())
    }

    /// Random-access read of the entry at `(log_id, offset)`. Every
    /// configured directory is probed for the segment file, since a given
    /// `log_id` lives under whichever directory happened to be picked when
    /// it was created.
    pub fn read_at(&self, log_id: u64, offset: u64, expect_ledger_id: i64, expect_entry_id: i64) -> BookieResult<Bytes> {
        for dir in self.dirs.all_dirs() {
            let path = segment_name(&format!("{dir}/current"), log_id);
            if !self.fs.exists(&path) {
                continue;
            }
            let mut file = self.fs.open(&path)?;
            file.seek_from_start(offset)?;
            let mut header = [0u8; HEADER_LEN];
            file.read_exact(&mut header)?;
            let body_len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
            let ledger_id = i64::from_be_bytes(header[4..12].try_into().unwrap());
            let entry_id = i64::from_be_bytes(header[12..20].try_into().unwrap());
            if ledger_id != expect_ledger_id || entry_id != expect_entry_id {
                return Err(Error::new(
                    ErrorKind::Corruption,
                    format!("entry log record at ({log_id}, {offset}) does not match expected ledger/entry id"),
                ));
            }
            let payload_len = body_len - (HEADER_LEN - 4);
            let mut payload = vec![0u8; payload_len];
            file.read_exact(&mut payload)?;
            return Ok(Bytes::from(payload));
        }
        Err(Error::new(
            ErrorKind::Io,
            format!("entry log segment {log_id} not found in any configured directory"),
        ))
    }

    pub fn current_log_id(&self) -> u64 {
        self.writer.lock().log_id
    }
}
