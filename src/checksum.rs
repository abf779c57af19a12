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

//! CRC wrapper used for journal record and entry-log frame checksums.

use crc::{Crc, Digest, CRC_64_XZ};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

#[derive(Clone)]
pub struct Crc64 {
    digest: Digest<'static, u64>,
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc64 {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }
    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }
    pub fn finish(self) -> u64 {
        self.digest.finalize()
    }
}

/// One-shot helper for the common case of checksumming a single buffer.
pub fn crc64(bytes: &[u8]) -> u64 {
    let mut c = Crc64::new();
    c.update(bytes);
    c.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_checksum() {
        assert_eq!(crc64(b"hello"), crc64(b"hello"));
    }

    #[test]
    fn different_input_different_checksum() {
        assert_ne!(crc64(b"hello"), crc64(b"world"));
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut c = Crc64::new();
        c.update(b"hel");
        c.update(b"lo");
        assert_eq!(c.finish(), crc64(b"hello"));
    }
}
