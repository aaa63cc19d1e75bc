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

//! The values stored in each table.
//!
//! Field names are kept to a single character since every byte is repeated
//! in every row.

use chrono::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::content::ContentId;
use crate::flags::Flags;
use crate::model::*;
use crate::support::error::Error;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(serde_cbor::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, Error> {
    Ok(serde_cbor::from_slice(raw)?)
}

/// The state of one placement, as stored in both `BY_MAILBOX_UID` and
/// `BY_MESSAGE_ID`.
///
/// Both rows carry the full state so that either can be read without the
/// other.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRow {
    #[serde(rename = "b", with = "serde_bytes")]
    pub mailbox: Vec<u8>,
    #[serde(rename = "m", with = "serde_bytes")]
    pub message: Vec<u8>,
    #[serde(rename = "u")]
    pub uid: Uid,
    #[serde(rename = "s")]
    pub mod_seq: Modseq,
    #[serde(rename = "f")]
    pub flags: Flags,
}

impl PlacementRow {
    pub fn from_state<S: IdScheme>(
        state: &ComposedMessageIdWithMetaData<S>,
    ) -> Self {
        PlacementRow {
            mailbox: state.mailbox_id().to_bytes(),
            message: state.message_id().to_bytes(),
            uid: state.uid(),
            mod_seq: state.mod_seq,
            flags: state.flags.clone(),
        }
    }

    pub fn into_state<S: IdScheme>(
        self,
    ) -> Result<ComposedMessageIdWithMetaData<S>, Error> {
        Ok(ComposedMessageIdWithMetaData {
            composed: ComposedMessageId {
                mailbox_id: S::MailboxId::from_bytes(&self.mailbox)?,
                message_id: S::MessageId::from_bytes(&self.message)?,
                uid: self.uid,
            },
            flags: self.flags,
            mod_seq: self.mod_seq,
        })
    }
}

/// The mailbox-independent description of a message, keyed by message id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    #[serde(rename = "d")]
    pub internal_date: DateTime<FixedOffset>,
    #[serde(rename = "z")]
    pub size: u64,
    #[serde(rename = "o")]
    pub body_start: u64,
    #[serde(rename = "h")]
    pub header: ContentId,
    #[serde(rename = "c")]
    pub body: ContentId,
    #[serde(rename = "a", default)]
    pub attachments: Vec<AttachmentRef>,
}

impl MessageRow {
    pub fn from_record<S: IdScheme>(record: &MessageRecord<S>) -> Self {
        MessageRow {
            internal_date: record.internal_date,
            size: record.size,
            body_start: record.body_start,
            header: record.header_content.clone(),
            body: record.body_content.clone(),
            attachments: record.attachments.clone(),
        }
    }

    pub fn into_record<S: IdScheme>(
        self,
        message_id: S::MessageId,
    ) -> MessageRecord<S> {
        MessageRecord {
            message_id,
            internal_date: self.internal_date,
            size: self.size,
            body_start: self.body_start,
            header_content: self.header,
            body_content: self.body,
            attachments: self.attachments,
        }
    }
}

/// Describes how a piece of content was split into chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    #[serde(rename = "z")]
    pub size: u64,
    #[serde(rename = "n")]
    pub chunks: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn placement_row_conversion() {
        let state = ComposedMessageIdWithMetaData::<NumericIds> {
            composed: ComposedMessageId {
                mailbox_id: 3,
                message_id: 99,
                uid: Uid::u(12),
            },
            flags: Flags::f(&["\\Seen", "$Junk"]),
            mod_seq: Modseq::u(40),
        };

        let raw = encode(&PlacementRow::from_state(&state)).unwrap();
        let row: PlacementRow = decode(&raw).unwrap();
        assert_eq!(3u64.to_bytes(), row.mailbox);
        assert_eq!(state, row.into_state::<NumericIds>().unwrap());
    }

    #[test]
    fn foreign_ids_rejected() {
        let row = PlacementRow {
            mailbox: vec![1, 2, 3],
            message: 5u64.to_bytes(),
            uid: Uid::MIN,
            mod_seq: Modseq::MIN,
            flags: Flags::new(),
        };
        assert_matches!(
            Err(Error::BadIdentifier),
            row.into_state::<NumericIds>()
        );
    }

    #[test]
    fn garbage_is_an_error() {
        assert_matches!(Err(Error::Cbor(_)), decode::<PlacementRow>(b"\xFF"));
    }
}
