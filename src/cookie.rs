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

//! Cookie: a fingerprint of this bookie's on-disk layout, pinned to cluster
//! identity.

use crate::checksum::crc64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub instance_id: String,
    pub disk_count: u32,
    pub layout_digest: u64,
}

impl Cookie {
    /// `ledger_dirs` is sorted internally so a reordered (but otherwise
    /// identical) directory list still produces a matching cookie.
    pub fn new(instance_id: impl Into<String>, ledger_dirs: &[String]) -> Self {
        let instance_id = instance_id.into();
        let mut sorted: Vec<&str> = ledger_dirs.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let mut buf = Vec::new();
        buf.extend_from_slice(instance_id.as_bytes());
        for dir in &sorted {
            buf.push(0);
            buf.extend_from_slice(dir.as_bytes());
        }
        Self {
            instance_id,
            disk_count: ledger_dirs.len() as u32,
            layout_digest: crc64(&buf),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.instance_id.len() + 4 + 8);
        buf.extend_from_slice(&(self.instance_id.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.instance_id.as_bytes());
        buf.extend_from_slice(&self.disk_count.to_be_bytes());
        buf.extend_from_slice(&self.layout_digest.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let id_len = u32::from_be_bytes(buf[0..4].try_into().ok()?) as usize;
        let mut off = 4;
        if buf.len() < off + id_len + 4 + 8 {
            return None;
        }
        let instance_id = String::from_utf8(buf[off..off + id_len].to_vec()).ok()?;
        off += id_len;
        let disk_count = u32::from_be_bytes(buf[off..off + 4].try_into().ok()?);
        off += 4;
        let layout_digest = u64::from_be_bytes(buf[off..off + 8].try_into().ok()?);
        Some(Self {
            instance_id,
            disk_count,
            layout_digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_encode_decode() {
        let c = Cookie::new("inst-1", &["/a".into(), "/b".into()]);
        let decoded = Cookie::decode(&c.encode()).unwrap();
        assert_eq!(c, decoded);
    }

    #[test]
    fn directory_order_does_not_change_digest() {
        let a = Cookie::new("inst-1", &["/a".into(), "/b".into()]);
        let b = Cookie::new("inst-1", &["/b".into(), "/a".into()]);
        assert_eq!(a.layout_digest, b.layout_digest);
    }

    #[test]
    fn different_instance_id_changes_digest() {
        let a = Cookie::new("inst-1", &["/a".into()]);
        let b = Cookie::new("inst-2", &["/a".into()]);
        assert_ne!(a.layout_digest, b.layout_digest);
    }
}
