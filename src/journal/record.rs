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

//! Journal record framing.
//!
//! Wire format per record:
//! `[len: u32][ledger_id: i64][entry_id: i64][payload: len - 16 bytes][crc64: u64]`
//! `len` covers `ledger_id + entry_id + payload`, not the crc trailer. Two
//! reserved `entry_id` sentinels mark metadata records that ride the same
//! append stream instead of a separate log: a ledger's master key, and a
//! fence witness.

use crate::checksum::crc64;

/// A journal entry whose `entry_id` equals this marks a ledger-key
/// metadata record: the payload is the ledger's master key.
pub const METAENTRY_ID_LEDGER_KEY: i64 = -0x1000;
/// A journal entry whose `entry_id` equals this marks a fence record: the
/// ledger is fenced and must refuse further non-recovery writes.
pub const METAENTRY_ID_FENCE_KEY: i64 = -0x2000;

const HEADER_LEN: usize = 4 + 8 + 8;
const CRC_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub ledger_id: i64,
    pub entry_id: i64,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn entry(ledger_id: i64, entry_id: i64, payload: Vec<u8>) -> Self {
        Self {
            ledger_id,
            entry_id,
            payload,
        }
    }

    pub fn ledger_key(ledger_id: i64, master_key: Vec<u8>) -> Self {
        Self {
            ledger_id,
            entry_id: METAENTRY_ID_LEDGER_KEY,
            payload: master_key,
        }
    }

    pub fn fence(ledger_id: i64) -> Self {
        Self {
            ledger_id,
            entry_id: METAENTRY_ID_FENCE_KEY,
            payload: Vec::new(),
        }
    }

    pub fn is_ledger_key(&self) -> bool {
        self.entry_id == METAENTRY_ID_LEDGER_KEY
    }

    pub fn is_fence(&self) -> bool {
        self.entry_id == METAENTRY_ID_FENCE_KEY
    }

    /// encoded length including the length prefix and crc trailer
    pub fn encoded_len(&self) -> usize {
        4 + HEADER_LEN - 4 + self.payload.len() + CRC_LEN
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let body_len = (HEADER_LEN - 4) + self.payload.len();
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.extend_from_slice(&self.ledger_id.to_be_bytes());
        buf.extend_from_slice(&self.entry_id.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc64(&buf[buf.len() - body_len..]);
        buf.extend_from_slice(&crc.to_be_bytes());
    }

    /// Decode one record from the front of `buf`, distinguishing a torn tail
    /// (not enough bytes yet written — tolerable, stop replay here) from
    /// interior corruption (enough bytes are present but the checksum
    /// doesn't match — fatal, since the journal is then corrupt).
    pub fn decode(buf: &[u8]) -> DecodeOutcome {
        if buf.len() < 4 {
            return DecodeOutcome::Incomplete;
        }
        let Ok(len_bytes) = buf[0..4].try_into() else {
            return DecodeOutcome::Incomplete;
        };
        let body_len = u32::from_be_bytes(len_bytes) as usize;
        let total = 4 + body_len + CRC_LEN;
        if buf.len() < total {
            return DecodeOutcome::Incomplete;
        }
        if body_len < HEADER_LEN - 4 {
            return DecodeOutcome::Corrupt;
        }
        let body = &buf[4..4 + body_len];
        let expected_crc = match buf[4 + body_len..total].try_into() {
            Ok(b) => u64::from_be_bytes(b),
            Err(_) => return DecodeOutcome::Corrupt,
        };
        if crc64(body) != expected_crc {
            return DecodeOutcome::Corrupt;
        }
        let ledger_id = i64::from_be_bytes(body[0..8].try_into().unwrap());
        let entry_id = i64::from_be_bytes(body[8..16].try_into().unwrap());
        let payload = body[16..].to_vec();
        DecodeOutcome::Ok(
            Self {
                ledger_id,
                entry_id,
                payload,
            },
            total,
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    Ok(Record, usize),
    /// fewer bytes are present than the record claims to need; the writer
    /// was interrupted mid-append
    Incomplete,
    /// enough bytes are present but the checksum doesn't match
    Corrupt,
}
