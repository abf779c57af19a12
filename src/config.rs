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

//! Typed configuration consumed by the core.
//!
//! Parsing a config file or CLI flags into this struct is the external
//! configuration loader's job; this module only defines the shape and the
//! defaults that apply when a field is left unset.

use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct BookieConfig {
    /// data directories, each holding a `current/` subdirectory
    pub ledger_dirs: Vec<String>,
    /// directory holding journal (`.txn`) files
    pub journal_dir: String,
    /// journal group-commit batch size, in records
    pub journal_batch_max_records: usize,
    /// journal group-commit batch window
    pub journal_batch_max_delay: Duration,
    /// journal file rotation threshold
    pub journal_max_file_size: u64,
    /// checkpoint (sync thread) interval
    pub checkpoint_interval: Duration,
    /// number of 8 KiB index pages kept resident in LedgerCache
    pub ledger_cache_max_pages: usize,
    /// entries addressed per index page
    pub index_entries_per_page: u64,
    /// entry-log segment rotation threshold
    pub entry_log_max_segment_size: u64,
    /// minor compaction ratio threshold; <= 0.0 disables the tier
    pub gc_minor_compaction_ratio: f64,
    /// minor compaction period
    pub gc_minor_compaction_period: Duration,
    /// major compaction ratio threshold; <= 0.0 disables the tier
    pub gc_major_compaction_ratio: f64,
    /// major compaction period
    pub gc_major_compaction_period: Duration,
    /// GC live-ledger-set poll interval
    pub gc_scan_interval: Duration,
    /// whether an all-disks-full condition transitions to read-only instead of
    /// triggering a fatal shutdown
    pub read_only_on_disk_full: bool,
    /// metadata-service root znode
    pub metadata_root: String,
    /// a directory with less free space than this is marked full
    pub ledger_dirs_low_space_threshold: u64,
    /// LedgerDirs background disk-health poll interval
    pub dir_poll_interval: Duration,
}

impl Default for BookieConfig {
    fn default() -> Self {
        Self {
            ledger_dirs: vec!["./data/ledgers".into()],
            journal_dir: "./data/journal".into(),
            journal_batch_max_records: 256,
            journal_batch_max_delay: Duration::from_millis(2),
            journal_max_file_size: 2 * 1024 * 1024 * 1024,
            checkpoint_interval: Duration::from_secs(60),
            ledger_cache_max_pages: 65536,
            index_entries_per_page: (8 * 1024) / 12,
            entry_log_max_segment_size: 2 * 1024 * 1024 * 1024,
            gc_minor_compaction_ratio: 0.2,
            gc_minor_compaction_period: Duration::from_secs(60 * 60),
            gc_major_compaction_ratio: 0.8,
            gc_major_compaction_period: Duration::from_secs(60 * 60 * 24),
            gc_scan_interval: Duration::from_secs(5 * 60),
            read_only_on_disk_full: true,
            metadata_root: "/ledgers".into(),
            ledger_dirs_low_space_threshold: 64 * 1024 * 1024,
            dir_poll_interval: Duration::from_secs(30),
        }
    }
}
