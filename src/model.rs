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

use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::hash::Hash;
use std::num::{NonZeroU32, NonZeroU64};

use byteorder::{BigEndian, ByteOrder};
use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::flags::Flags;
use crate::storage::content::ContentId;
use crate::support::error::Error;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. UIDs are never reused, not even after the message holding one is
/// deleted. Unlike a single-node store, UIDs here are not guaranteed to be
/// dense: an allocation whose caller crashes leaves a permanent gap.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self = unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        if Uid::MAX == self {
            None
        } else {
            Uid::of(self.0.get() + 1)
        }
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// A CONDSTORE "modifier sequence" number.
///
/// Modseqs are allocated per mailbox from 1 upwards. Every addition of a
/// message and every effective flag change within the mailbox consumes a new
/// one. As with `Uid`, the sequence may contain gaps.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Modseq(NonZeroU64);

impl Modseq {
    // Unsafe because NonZeroU64::new() is non-const.
    pub const MIN: Self = unsafe { Modseq(NonZeroU64::new_unchecked(1)) };

    pub fn of(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Modseq)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Modseq::of)
    }

    #[cfg(test)]
    pub fn u(raw: u64) -> Self {
        Modseq::of(raw).unwrap()
    }
}

impl fmt::Debug for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Modseq({})", self.0.get())
    }
}

/// An IMAP-style interval of UIDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UidRange {
    /// Exactly one message.
    One(Uid),
    /// The given UID and everything after it (`uid:*`).
    From(Uid),
    /// An inclusive range.
    Range(Uid, Uid),
    /// Every message (`1:*`).
    All,
}

impl UidRange {
    /// Return the inclusive bounds of this range.
    pub fn bounds(self) -> (Uid, Uid) {
        match self {
            UidRange::One(uid) => (uid, uid),
            UidRange::From(uid) => (uid, Uid::MAX),
            UidRange::Range(start, end) => (start.min(end), end.max(start)),
            UidRange::All => (Uid::MIN, Uid::MAX),
        }
    }

    pub fn contains(self, uid: Uid) -> bool {
        let (start, end) = self.bounds();
        uid >= start && uid <= end
    }

    /// Parse a single IMAP sequence-set element (no commas).
    ///
    /// `*` is open-ended rather than resolved against the mailbox, since a
    /// distributed store has no stable notion of "the current last UID".
    pub fn parse(raw: &str) -> Option<Self> {
        fn do_parse(r: &str) -> Option<Option<Uid>> {
            if "*" == r {
                Some(None)
            } else {
                r.parse::<u32>().ok().and_then(Uid::of).map(Some)
            }
        }

        let mut parts = raw.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(only), None, None) => match do_parse(only)? {
                Some(uid) => Some(UidRange::One(uid)),
                None => Some(UidRange::All),
            },
            (Some(start), Some(end), None) => {
                match (do_parse(start)?, do_parse(end)?) {
                    (Some(a), Some(b)) if a == b => Some(UidRange::One(a)),
                    // RFC 3501 allows the endpoints to be in either order
                    (Some(a), Some(b)) => {
                        Some(UidRange::Range(a.min(b), a.max(b)))
                    }
                    (Some(a), None) | (None, Some(a)) if a == Uid::MIN => {
                        Some(UidRange::All)
                    }
                    (Some(a), None) | (None, Some(a)) => {
                        Some(UidRange::From(a))
                    }
                    (None, None) => Some(UidRange::All),
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            UidRange::One(uid) => write!(f, "{}", uid),
            UidRange::From(uid) => write!(f, "{}:*", uid),
            UidRange::Range(start, end) => write!(f, "{}:{}", start, end),
            UidRange::All => write!(f, "1:*"),
        }
    }
}

/// An opaque, comparable, never-reused identifier for a mailbox or message.
///
/// The storage layer only ever sees the byte form, so identifier types of any
/// backend can be plugged in without the core branching on them.
pub trait Identifier:
    Clone
    + fmt::Debug
    + fmt::Display
    + PartialEq
    + Eq
    + PartialOrd
    + Ord
    + Hash
    + Send
    + Sync
    + 'static
{
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(raw: &[u8]) -> Result<Self, Error>;
}

impl Identifier for u64 {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        let raw: [u8; 8] = raw.try_into().map_err(|_| Error::BadIdentifier)?;
        Ok(u64::from_be_bytes(raw))
    }
}

/// A time-based identifier: creation time in milliseconds followed by 64
/// random bits.
///
/// These sort by creation time, which keeps the keys of recently created
/// objects close together.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeId {
    millis: u64,
    nonce: u64,
}

impl TimeId {
    pub fn new() -> Self {
        TimeId {
            millis: Utc::now().timestamp_millis().max(0) as u64,
            nonce: rand::random(),
        }
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.millis as i64).single()
    }
}

impl Default for TimeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.millis, self.nonce)
    }
}

impl fmt::Debug for TimeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TimeId({})", self)
    }
}

impl Identifier for TimeId {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 16];
        BigEndian::write_u64(&mut buf[..8], self.millis);
        BigEndian::write_u64(&mut buf[8..], self.nonce);
        buf
    }

    fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        if 16 != raw.len() {
            return Err(Error::BadIdentifier);
        }

        Ok(TimeId {
            millis: BigEndian::read_u64(&raw[..8]),
            nonce: BigEndian::read_u64(&raw[8..]),
        })
    }
}

/// Binds together the identifier types used by one deployment.
pub trait IdScheme:
    Clone + Copy + fmt::Debug + PartialEq + Eq + Hash + Send + Sync + 'static
{
    type MailboxId: Identifier;
    type MessageId: Identifier;
}

/// Time-based identifiers for both mailboxes and messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeIds;

impl IdScheme for TimeIds {
    type MailboxId = TimeId;
    type MessageId = TimeId;
}

/// Plain integer identifiers, for backends that allocate ids themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NumericIds;

impl IdScheme for NumericIds {
    type MailboxId = u64;
    type MessageId = u64;
}

/// A mailbox as resolved by the `MailboxMapper`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox<S: IdScheme> {
    pub id: S::MailboxId,
    /// The namespace (e.g. `#private`) the mailbox lives in.
    pub namespace: String,
    /// The user owning the mailbox.
    pub user: String,
    /// The full path of the mailbox within its namespace.
    pub name: String,
    pub uid_validity: u32,
}

/// Identifies one placement of one message in one mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComposedMessageId<S: IdScheme> {
    pub mailbox_id: S::MailboxId,
    pub message_id: S::MessageId,
    pub uid: Uid,
}

/// The mutable state of one placement.
///
/// This is what the two placement tables must agree on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposedMessageIdWithMetaData<S: IdScheme> {
    pub composed: ComposedMessageId<S>,
    pub flags: Flags,
    pub mod_seq: Modseq,
}

impl<S: IdScheme> ComposedMessageIdWithMetaData<S> {
    pub fn uid(&self) -> Uid {
        self.composed.uid
    }

    pub fn mailbox_id(&self) -> &S::MailboxId {
        &self.composed.mailbox_id
    }

    pub fn message_id(&self) -> &S::MessageId {
        &self.composed.message_id
    }
}

/// An opaque reference to an attachment extracted from a message.
///
/// The store carries these with the message without interpreting them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment_id: String,
    pub name: Option<String>,
    pub cid: Option<String>,
    pub is_inline: bool,
}

/// A message to be added to a mailbox.
#[derive(Clone, Debug)]
pub struct MessageDraft<S: IdScheme> {
    /// The id the message is to be known by, across all mailboxes.
    pub message_id: S::MessageId,
    /// The `INTERNALDATE` of the message.
    pub internal_date: DateTime<FixedOffset>,
    /// The raw header block, including the blank line terminating it.
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    /// Flags to set on the new placement.
    pub flags: Flags,
    pub attachments: Vec<AttachmentRef>,
}

impl<S: IdScheme> MessageDraft<S> {
    /// Create a draft with no flags or attachments, received now.
    pub fn new(
        message_id: S::MessageId,
        header: Vec<u8>,
        body: Vec<u8>,
    ) -> Self {
        MessageDraft {
            message_id,
            internal_date: Utc::now().into(),
            header,
            body,
            flags: Flags::new(),
            attachments: vec![],
        }
    }
}

/// The immutable, mailbox-independent description of a stored message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord<S: IdScheme> {
    pub message_id: S::MessageId,
    pub internal_date: DateTime<FixedOffset>,
    /// Total size of header and body.
    pub size: u64,
    /// Offset of the body within the full message.
    pub body_start: u64,
    pub header_content: ContentId,
    pub body_content: ContentId,
    pub attachments: Vec<AttachmentRef>,
}

/// What `add`, `copy` and `move` report about the placement they created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMetaData<S: IdScheme> {
    pub placement: ComposedMessageIdWithMetaData<S>,
    pub size: u64,
    pub internal_date: DateTime<FixedOffset>,
}

impl<S: IdScheme> MessageMetaData<S> {
    pub fn uid(&self) -> Uid {
        self.placement.uid()
    }

    pub fn mod_seq(&self) -> Modseq {
        self.placement.mod_seq
    }
}

/// A placement together with its message, and optionally its content.
#[derive(Clone, Debug)]
pub struct MailboxMessage<S: IdScheme> {
    pub placement: ComposedMessageIdWithMetaData<S>,
    pub record: MessageRecord<S>,
    /// `(header, body)`, if requested.
    pub content: Option<(Vec<u8>, Vec<u8>)>,
}

/// How much of each message a retrieval should load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchType {
    /// Placement and message record only.
    Metadata,
    /// Also the header and body content.
    Full,
}

/// A successful flag change, for callers building change notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatedFlags {
    pub uid: Uid,
    pub mod_seq: Modseq,
    pub old_flags: Flags,
    pub new_flags: Flags,
}

impl UpdatedFlags {
    pub fn flags_changed(&self) -> bool {
        self.old_flags != self.new_flags
    }
}

/// Why a placement was left out of the results of a flag update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The message was deleted from the mailbox while the update retried.
    Deleted,
    /// The whole mailbox went away while the update retried.
    MailboxDeleted,
}

/// The result of updating the flags of a single placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlagsUpdateOutcome {
    /// The new flags were written with a fresh modseq.
    Updated(UpdatedFlags),
    /// The calculator did not change anything, so nothing was written.
    Unchanged(UpdatedFlags),
    /// The placement vanished; not an error.
    Skipped(Uid, SkipReason),
}

impl FlagsUpdateOutcome {
    pub fn into_updated_flags(self) -> Option<UpdatedFlags> {
        match self {
            FlagsUpdateOutcome::Updated(u)
            | FlagsUpdateOutcome::Unchanged(u) => Some(u),
            FlagsUpdateOutcome::Skipped(..) => None,
        }
    }
}

/// What `update_flags` did to each placement of the range it was given.
#[derive(Debug, Default)]
pub struct FlagsUpdateReport {
    /// Placements updated or left unchanged, in UID order.
    pub updated: Vec<UpdatedFlags>,
    /// Placements whose update failed. Any of these may or may not have been
    /// written, and must be read again to find out.
    pub failed: Vec<(Uid, Error)>,
}

impl FlagsUpdateReport {
    /// Return the updates, or the first failure if there was one.
    pub fn into_result(self) -> Result<Vec<UpdatedFlags>, Error> {
        match self.failed.into_iter().next() {
            None => Ok(self.updated),
            Some((_, e)) => Err(e),
        }
    }
}

/// The cached message counts of a mailbox.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct MailboxCounters {
    pub count: u64,
    pub unseen: u64,
}
