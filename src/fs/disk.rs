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

//! Real, `std::fs`-backed [`FsProvider`].

use {
    super::{BookieFile, FileOpen, FsProvider},
    crate::error::{BookieResult, Error, ErrorKind},
    std::{
        fs::{self, File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        path::Path,
    },
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFs;

/// Holds the lock file open for as long as this guard lives; on unix this
/// also holds an exclusive `flock(2)` on it, released when the fd closes.
pub struct DiskDirLock(#[allow(dead_code)] File);

impl FsProvider for DiskFs {
    type File = DiskFile;
    type DirLock = DiskDirLock;

    fn create_dir_all(&self, path: &str) -> BookieResult<()> {
        Ok(fs::create_dir_all(path)?)
    }
    fn remove_dir_all(&self, path: &str) -> BookieResult<()> {
        if Path::new(path).exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
    fn remove_file(&self, path: &str) -> BookieResult<()> {
        Ok(fs::remove_file(path)?)
    }
    fn rename(&self, from: &str, to: &str) -> BookieResult<()> {
        Ok(fs::rename(from, to)?)
    }
    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
    fn read_dir(&self, path: &str) -> BookieResult<Vec<String>> {
        let mut out = vec![];
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(out)
    }
    fn open_or_create(&self, path: &str) -> BookieResult<FileOpen<Self::File>> {
        let created = !Path::new(path).exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file = DiskFile(file);
        Ok(if created {
            FileOpen::Created(file)
        } else {
            FileOpen::Existing(file)
        })
    }
    fn open(&self, path: &str) -> BookieResult<Self::File> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(DiskFile(file))
    }
    fn free_space(&self, path: &str) -> BookieResult<u64> {
        use sysinfo::Disks;
        let target = fs::canonicalize(path).unwrap_or_else(|_| Path::new(path).to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        let mut best: Option<(&Path, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if target.starts_with(mount) {
                let depth = mount.components().count();
                if best.map(|(m, _)| depth > m.components().count()).unwrap_or(true) {
                    best = Some((mount, disk.available_space()));
                }
            }
        }
        Ok(best.map(|(_, space)| space).unwrap_or(u64::MAX))
    }
    fn lock_dir(&self, path: &str) -> BookieResult<Self::DirLock> {
        fs::create_dir_all(path)?;
        let lock_path = Path::new(path).join(".lock");
        let file = OpenOptions::new().write(true).create(true).open(&lock_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                return Err(Error::new(
                    ErrorKind::Io,
                    format!("directory {path} is locked by another bookie process"),
                ));
            }
        }
        Ok(DiskDirLock(file))
    }
}

pub struct DiskFile(File);

impl BookieFile for DiskFile {
    fn read_exact(&mut self, buf: &mut [u8]) -> BookieResult<()> {
        Ok(Read::read_exact(&mut self.0, buf)?)
    }
    fn write_all(&mut self, buf: &[u8]) -> BookieResult<()> {
        Ok(Write::write_all(&mut self.0, buf)?)
    }
    fn flush(&mut self) -> BookieResult<()> {
        Ok(Write::flush(&mut self.0)?)
    }
    fn sync_all(&mut self) -> BookieResult<()> {
        Ok(self.0.sync_all()?)
    }
    fn len(&self) -> BookieResult<u64> {
        Ok(self.0.metadata()?.len())
    }
    fn seek_from_start(&mut self, pos: u64) -> BookieResult<()> {
        self.0.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
    fn cursor(&mut self) -> BookieResult<u64> {
        Ok(self.0.stream_position()?)
    }
    fn truncate(&mut self, len: u64) -> BookieResult<()> {
        self.0.set_len(len)?;
        if self.cursor()? > len {
            self.seek_from_start(len)?;
        }
        Ok(())
    }
}
