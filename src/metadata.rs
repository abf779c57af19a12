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

//! The metadata-service collaborator: a hierarchical KV store with
//! ephemeral nodes, watches, and atomic create, used only for cluster
//! membership, instance identity, and fencing witness nodes.
//!
//! This module defines the trait the core consumes and an in-memory test
//! double; no real ZooKeeper-alike client ships in this crate.

use {
    crate::error::BookieResult,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// A single session's ephemeral registrations are tied to `session_id`; when a
/// session expires every ephemeral node it created disappears.
pub type SessionId = u64;

pub trait MetadataClient: Send + Sync + 'static {
    /// create a persistent node with `data` if absent; tolerate "already
    /// exists"
    fn create_if_absent(&self, path: &str, data: &[u8]) -> BookieResult<()>;
    fn read(&self, path: &str) -> BookieResult<Option<Vec<u8>>>;
    fn write(&self, path: &str, data: &[u8]) -> BookieResult<()>;
    /// create an ephemeral node bound to `session`; fails if one already
    /// exists at `path`
    fn create_ephemeral(&self, path: &str, data: &[u8], session: SessionId) -> BookieResult<()>;
    fn delete(&self, path: &str) -> BookieResult<()>;
    fn exists(&self, path: &str) -> bool;
    fn children(&self, path: &str) -> BookieResult<Vec<String>>;
    /// true once every ephemeral node the given session owns has expired
    fn session_expired(&self, session: SessionId) -> bool;
    fn expire_session(&self, session: SessionId);
    /// mint a fresh session id for this client to bind ephemeral
    /// registrations to
    fn new_session(&self) -> SessionId;
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Vec<u8>>,
    ephemeral_owner: HashMap<String, SessionId>,
    expired_sessions: std::collections::HashSet<SessionId>,
}

#[derive(Clone)]
pub struct InMemoryMetadataClient {
    inner: Arc<Mutex<Inner>>,
    next_session: Arc<AtomicU64>,
}

impl Default for InMemoryMetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetadataClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn new_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

impl MetadataClient for InMemoryMetadataClient {
    fn create_if_absent(&self, path: &str, data: &[u8]) -> BookieResult<()> {
        let mut inner = self.inner.lock();
        inner.nodes.entry(path.to_string()).or_insert_with(|| data.to_vec());
        Ok(())
    }
    fn read(&self, path: &str) -> BookieResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().nodes.get(path).cloned())
    }
    fn write(&self, path: &str, data: &[u8]) -> BookieResult<()> {
        self.inner.lock().nodes.insert(path.to_string(), data.to_vec());
        Ok(())
    }
    fn create_ephemeral(&self, path: &str, data: &[u8], session: SessionId) -> BookieResult<()> {
        let mut inner = self.inner.lock();
        if inner.expired_sessions.contains(&session) {
            return Err(crate::error::Error::new(
                crate::error::ErrorKind::Metadata,
                "session expired".to_string(),
            ));
        }
        if inner.nodes.contains_key(path) {
            return Err(crate::error::Error::new(
                crate::error::ErrorKind::Metadata,
                format!("node already exists: {path}"),
            ));
        }
        inner.nodes.insert(path.to_string(), data.to_vec());
        inner.ephemeral_owner.insert(path.to_string(), session);
        Ok(())
    }
    fn delete(&self, path: &str) -> BookieResult<()> {
        let mut inner = self.inner.lock();
        inner.nodes.remove(path);
        inner.ephemeral_owner.remove(path);
        Ok(())
    }
    fn exists(&self, path: &str) -> bool {
        self.inner.lock().nodes.contains_key(path)
    }
    fn children(&self, path: &str) -> BookieResult<Vec<String>> {
        let inner = self.inner.lock();
        let prefix = format!("{path}/");
        let mut out: Vec<String> = inner
            .nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(String::from)
            .collect();
        out.sort();
        Ok(out)
    }
    fn session_expired(&self, session: SessionId) -> bool {
        self.inner.lock().expired_sessions.contains(&session)
    }
    fn expire_session(&self, session: SessionId) {
        let mut inner = self.inner.lock();
        inner.expired_sessions.insert(session);
        let dead: Vec<String> = inner
            .ephemeral_owner
            .iter()
            .filter(|(_, s)| **s == session)
            .map(|(p, _)| p.clone())
            .collect();
        for path in dead {
            inner.nodes.remove(&path);
            inner.ephemeral_owner.remove(&path);
        }
    }
    fn new_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_if_absent_tolerates_existing() {
        let md = InMemoryMetadataClient::new();
        md.create_if_absent("/ledgers", b"x").unwrap();
        md.create_if_absent("/ledgers", b"y").unwrap();
        assert_eq!(md.read("/ledgers").unwrap().unwrap(), b"x");
    }

    #[test]
    fn ephemeral_node_vanishes_on_session_expiry() {
        let md = InMemoryMetadataClient::new();
        let session = md.new_session();
        md.create_ephemeral("/bookies/available/b1", b"", session)
            .unwrap();
        assert!(md.exists("/bookies/available/b1"));
        md.expire_session(session);
        assert!(!md.exists("/bookies/available/b1"));
    }

    #[test]
    fn second_ephemeral_registration_conflicts_until_first_gone() {
        let md = InMemoryMetadataClient::new();
        let s1 = md.new_session();
        md.create_ephemeral("/bookies/available/b1", b"", s1).unwrap();
        let s2 = md.new_session();
        assert!(md.create_ephemeral("/bookies/available/b1", b"", s2).is_err());
        md.delete("/bookies/available/b1").unwrap();
        md.create_ephemeral("/bookies/available/b1", b"", s2).unwrap();
    }
}
