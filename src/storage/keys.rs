//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Kvmail.
//
// Kvmail is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Kvmail is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Kvmail. If not, see <http://www.gnu.org/licenses/>.

//! Row key layout.
//!
//! Every key starts with a one-byte table tag. Identifiers are written with a
//! big-endian `u16` length prefix, so the key of one mailbox is never a prefix
//! of the keys of another. UIDs are written as big-endian `u32` so that the
//! byte order of keys is the numeric order of UIDs.

use std::convert::TryInto;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::model::{Identifier, Uid};
use crate::support::error::Error;

/// Per-mailbox UID counter.
pub const UID_SEQUENCE: u8 = 0x01;
/// Per-mailbox modseq counter.
pub const MODSEQ_SEQUENCE: u8 = 0x02;
/// Placements keyed by (mailbox, uid).
pub const BY_MAILBOX_UID: u8 = 0x10;
/// Placements keyed by (message, mailbox, uid).
pub const BY_MESSAGE_ID: u8 = 0x11;
pub const COUNTERS: u8 = 0x20;
/// One empty row per (mailbox, uid) carrying `\Recent`.
pub const RECENT: u8 = 0x21;
pub const FIRST_UNSEEN: u8 = 0x22;
pub const APPLICABLE_FLAGS: u8 = 0x23;
/// Mailbox-independent message rows.
pub const MESSAGE: u8 = 0x30;
/// Content chunks, keyed by (content id, chunk index).
pub const BLOB_CHUNK: u8 = 0x40;
pub const BLOB_DESCRIPTOR: u8 = 0x41;

#[derive(Clone, Debug)]
pub struct KeyBuilder {
    buf: Vec<u8>,
}

impl KeyBuilder {
    pub fn new(table: u8) -> Self {
        let mut buf = Vec::with_capacity(40);
        buf.push(table);
        KeyBuilder { buf }
    }

    pub fn id(self, id: &impl Identifier) -> Self {
        self.bytes(&id.to_bytes())
    }

    /// Append a length-prefixed byte string.
    ///
    /// Byte strings longer than `u16::MAX` are truncated; no identifier or
    /// content id comes anywhere near that.
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        let len = bytes.len().min(u16::MAX.into());
        // Writes to a Vec cannot fail
        let _ = self.buf.write_u16::<BigEndian>(len as u16);
        self.buf.extend_from_slice(&bytes[..len]);
        self
    }

    pub fn uid(self, uid: Uid) -> Self {
        self.u32(uid.get())
    }

    pub fn u32(mut self, v: u32) -> Self {
        let _ = self.buf.write_u32::<BigEndian>(v);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

/// Return the smallest key greater than every key starting with `prefix`.
///
/// Returns an empty vector, which `KvStore::scan` treats as unbounded, if no
/// such key exists.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return end;
        }
    }

    end
}

/// Decode the UID at the end of a key built with `KeyBuilder::uid`.
pub fn trailing_uid(key: &[u8]) -> Result<Uid, Error> {
    let split = key
        .len()
        .checked_sub(4)
        .ok_or(Error::CorruptRow("key too short"))?;
    let raw: [u8; 4] = key[split..]
        .try_into()
        .map_err(|_| Error::CorruptRow("key too short"))?;
    Uid::of(BigEndian::read_u32(&raw)).ok_or(Error::CorruptRow("zero UID"))
}

pub fn uid_sequence(mailbox: &impl Identifier) -> Vec<u8> {
    KeyBuilder::new(UID_SEQUENCE).id(mailbox).build()
}

pub fn modseq_sequence(mailbox: &impl Identifier) -> Vec<u8> {
    KeyBuilder::new(MODSEQ_SEQUENCE).id(mailbox).build()
}

pub fn by_mailbox_uid(mailbox: &impl Identifier, uid: Uid) -> Vec<u8> {
    KeyBuilder::new(BY_MAILBOX_UID).id(mailbox).uid(uid).build()
}

pub fn by_message_id(
    message: &impl Identifier,
    mailbox: &impl Identifier,
    uid: Uid,
) -> Vec<u8> {
    KeyBuilder::new(BY_MESSAGE_ID)
        .id(message)
        .id(mailbox)
        .uid(uid)
        .build()
}

pub fn counters(mailbox: &impl Identifier) -> Vec<u8> {
    KeyBuilder::new(COUNTERS).id(mailbox).build()
}

pub fn recent(mailbox: &impl Identifier, uid: Uid) -> Vec<u8> {
    KeyBuilder::new(RECENT).id(mailbox).uid(uid).build()
}

pub fn first_unseen(mailbox: &impl Identifier) -> Vec<u8> {
    KeyBuilder::new(FIRST_UNSEEN).id(mailbox).build()
}

pub fn applicable_flags(mailbox: &impl Identifier) -> Vec<u8> {
    KeyBuilder::new(APPLICABLE_FLAGS).id(mailbox).build()
}

pub fn message(message: &impl Identifier) -> Vec<u8> {
    KeyBuilder::new(MESSAGE).id(message).build()
}

/// The `[start, end)` key range of the rows of `table` for `mailbox` whose
/// UIDs lie within the inclusive bounds given.
pub fn uid_span(
    table: u8,
    mailbox: &impl Identifier,
    first: Uid,
    last: Uid,
) -> (Vec<u8>, Vec<u8>) {
    let start = KeyBuilder::new(table).id(mailbox).uid(first).build();
    let end = match last.next() {
        Some(after) => KeyBuilder::new(table).id(mailbox).uid(after).build(),
        None => prefix_end(&KeyBuilder::new(table).id(mailbox).build()),
    };
    (start, end)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uid_order_is_key_order() {
        let a = by_mailbox_uid(&1u64, Uid::u(255));
        let b = by_mailbox_uid(&1u64, Uid::u(256));
        let c = by_mailbox_uid(&2u64, Uid::u(1));
        assert!(a < b);
        assert!(b < c);
        assert_eq!(Uid::u(256), trailing_uid(&b).unwrap());
    }

    #[test]
    fn prefix_end_computation() {
        assert_eq!(vec![1, 3], prefix_end(&[1, 2]));
        assert_eq!(vec![2], prefix_end(&[1, 0xFF]));
        assert_eq!(Vec::<u8>::new(), prefix_end(&[0xFF, 0xFF]));
        assert_eq!(Vec::<u8>::new(), prefix_end(&[]));
    }

    #[test]
    fn uid_span_bounds() {
        let (start, end) =
            uid_span(BY_MAILBOX_UID, &7u64, Uid::u(2), Uid::u(4));
        assert!(start <= by_mailbox_uid(&7u64, Uid::u(2)));
        assert!(end > by_mailbox_uid(&7u64, Uid::u(4)));
        assert!(end <= by_mailbox_uid(&7u64, Uid::u(5)));

        let (_, end) = uid_span(BY_MAILBOX_UID, &7u64, Uid::MIN, Uid::MAX);
        assert!(end > by_mailbox_uid(&7u64, Uid::MAX));
        assert!(end < by_mailbox_uid(&8u64, Uid::MIN));
    }

    #[test]
    fn short_keys_rejected() {
        assert_matches!(Err(Error::CorruptRow(_)), trailing_uid(&[1, 2]));
        assert_matches!(Err(Error::CorruptRow(_)), trailing_uid(&[0, 0, 0, 0]));
    }
}
