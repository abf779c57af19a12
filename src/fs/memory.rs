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

//! An in-memory [`FsProvider`] for fast, deterministic tests.
//!
//! Follows the shape of `engine/storage/v1/memfs.rs`'s virtual filesystem,
//! but instance-scoped (an `Arc`-shared table per [`MemFs`]) rather than a
//! single process-global `static`, so concurrent tests don't share state.

use {
    super::{BookieFile, FileOpen, FsProvider},
    crate::error::{BookieResult, Error, ErrorKind},
    parking_lot::Mutex,
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    },
};

fn not_found(path: &str) -> Error {
    Error::new(ErrorKind::Io, format!("no such file or directory: {path}"))
}

#[derive(Default)]
struct Inner {
    dirs: HashSet<String>,
    files: HashMap<String, Vec<u8>>,
    free_space: Option<u64>,
}

/// A shared, in-memory filesystem. Clones share the same backing table.
#[derive(Clone, Default)]
pub struct MemFs(Arc<Mutex<Inner>>);

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force [`FsProvider::free_space`] to report `bytes` for every path,
    /// simulating an `allDisksFull` condition for [`crate::dirs::LedgerDirs`]
    /// tests without needing real disk pressure.
    pub fn set_free_space(&self, bytes: u64) {
        self.0.lock().free_space = Some(bytes);
    }

    fn parent_of(path: &str) -> Option<&str> {
        path.rfind('/').map(|i| &path[..i])
    }
}

impl FsProvider for MemFs {
    type File = MemFile;
    type DirLock = ();

    fn create_dir_all(&self, path: &str) -> BookieResult<()> {
        let mut inner = self.0.lock();
        let mut acc = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !acc.is_empty() {
                acc.push('/');
            }
            acc.push_str(component);
            inner.dirs.insert(acc.clone());
        }
        Ok(())
    }
    fn remove_dir_all(&self, path: &str) -> BookieResult<()> {
        let mut inner = self.0.lock();
        let prefix = format!("{path}/");
        inner.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        inner
            .files
            .retain(|f, _| f != path && !f.starts_with(&prefix));
        Ok(())
    }
    fn remove_file(&self, path: &str) -> BookieResult<()> {
        let mut inner = self.0.lock();
        inner.files.remove(path).map(|_| ()).ok_or_else(|| not_found(path))
    }
    fn rename(&self, from: &str, to: &str) -> BookieResult<()> {
        let mut inner = self.0.lock();
        let data = inner.files.remove(from).ok_or_else(|| not_found(from))?;
        inner.files.insert(to.to_string(), data);
        Ok(())
    }
    fn exists(&self, path: &str) -> bool {
        let inner = self.0.lock();
        inner.dirs.contains(path) || inner.files.contains_key(path)
    }
    fn read_dir(&self, path: &str) -> BookieResult<Vec<String>> {
        let inner = self.0.lock();
        let prefix = format!("{path}/");
        let mut names = HashSet::new();
        for d in &inner.dirs {
            if let Some(rest) = d.strip_prefix(&prefix) {
                if !rest.is_empty() {
                    names.insert(rest.split('/').next().unwrap().to_string());
                }
            }
        }
        for f in inner.files.keys() {
            if let Some(rest) = f.strip_prefix(&prefix) {
                if !rest.is_empty() {
                    names.insert(rest.split('/').next().unwrap().to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }
    fn open_or_create(&self, path: &str) -> BookieResult<FileOpen<Self::File>> {
        let mut inner = self.0.lock();
        if let Some(parent) = Self::parent_of(path) {
            inner.dirs.insert(parent.to_string());
        }
        let created = !inner.files.contains_key(path);
        if created {
            inner.files.insert(path.to_string(), vec![]);
        }
        let file = MemFile {
            fs: self.0.clone(),
            path: path.to_string(),
            pos: 0,
        };
        Ok(if created {
            FileOpen::Created(file)
        } else {
            FileOpen::Existing(file)
        })
    }
    fn open(&self, path: &str) -> BookieResult<Self::File> {
        let inner = self.0.lock();
        if !inner.files.contains_key(path) {
            return Err(not_found(path));
        }
        Ok(MemFile {
            fs: self.0.clone(),
            path: path.to_string(),
            pos: 0,
        })
    }
    fn free_space(&self, _path: &str) -> BookieResult<u64> {
        Ok(self.0.lock().free_space.unwrap_or(u64::MAX))
    }
    fn lock_dir(&self, _path: &str) -> BookieResult<()> {
        Ok(())
    }
}

pub struct MemFile {
    fs: Arc<Mutex<Inner>>,
    path: String,
    pos: usize,
}

impl BookieFile for MemFile {
    fn read_exact(&mut self, buf: &mut [u8]) -> BookieResult<()> {
        let inner = self.fs.lock();
        let data = inner.files.get(&self.path).ok_or_else(|| not_found(&self.path))?;
        if self.pos + buf.len() > data.len() {
            return Err(Error::new(
                ErrorKind::Io,
                "unexpected end of file".to_string(),
            ));
        }
        buf.copy_from_slice(&data[self.pos..self.pos + buf.len()]);
        self.pos += buf.len();
        Ok(())
    }
    fn write_all(&mut self, buf: &[u8]) -> BookieResult<()> {
        let mut inner = self.fs.lock();
        let data = inner.files.get_mut(&self.path).ok_or_else(|| not_found(&self.path))?;
        if self.pos + buf.len() > data.len() {
            data.resize(self.pos + buf.len(), 0);
        }
        data[self.pos..self.pos + buf.len()].copy_from_slice(buf);
        self.pos += buf.len();
        Ok(())
    }
    fn flush(&mut self) -> BookieResult<()> {
        Ok(())
    }
    fn sync_all(&mut self) -> BookieResult<()> {
        Ok(())
    }
    fn len(&self) -> BookieResult<u64> {
        let inner = self.fs.lock();
        Ok(inner
            .files
            .get(&self.path)
            .ok_or_else(|| not_found(&self.path))?
            .len() as u64)
    }
    fn seek_from_start(&mut self, pos: u64) -> BookieResult<()> {
        self.pos = pos as usize;
        Ok(())
    }
    fn cursor(&mut self) -> BookieResult<u64> {
        Ok(self.pos as u64)
    }
    fn truncate(&mut self, len: u64) -> BookieResult<()> {
        let mut inner = self.fs.lock();
        let data = inner.files.get_mut(&self.path).ok_or_else(|| not_found(&self.path))?;
        data.resize(len as usize, 0);
        if self.pos > data.len() {
            self.pos = data.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let fs = MemFs::new();
        fs.create_dir_all("a/b").unwrap();
        let mut f = fs.open_or_create("a/b/f.dat").unwrap().into_inner();
        f.write_all(b"hello world").unwrap();
        f.seek_from_start(0).unwrap();
        let mut buf = [0u8; 5];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn torn_write_then_truncate_then_reopen() {
        let fs = MemFs::new();
        let mut f = fs.open_or_create("j.txn").unwrap().into_inner();
        f.write_all(b"0123456789").unwrap();
        drop(f);
        let mut f = fs.open("j.txn").unwrap();
        f.truncate(5).unwrap();
        assert_eq!(f.len().unwrap(), 5);
    }

    #[test]
    fn remove_dir_all_clears_nested_files() {
        let fs = MemFs::new();
        fs.create_dir_all("x/y").unwrap();
        fs.open_or_create("x/y/f.dat").unwrap();
        fs.remove_dir_all("x").unwrap();
        assert!(!fs.exists("x/y/f.dat"));
        assert!(!fs.exists("x"));
    }
}
