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

use std::marker::PhantomData;
use std::sync::Arc;

use super::keys;
use super::rows::{decode, encode, MessageRow};
use super::KvStore;
use crate::model::{IdScheme, MessageRecord};
use crate::support::error::Error;

/// Access to the mailbox-independent message rows.
///
/// A message row is written once, when the message is first added, and shared
/// by every placement of the message. It is never deleted.
pub struct MessageStore<S: IdScheme> {
    store: Arc<dyn KvStore>,
    _ids: PhantomData<S>,
}

impl<S: IdScheme> MessageStore<S> {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        MessageStore {
            store,
            _ids: PhantomData,
        }
    }

    /// Write the row for `record`.
    ///
    /// Rewriting an existing message is harmless since the content of a
    /// message id never changes.
    pub async fn insert(&self, record: &MessageRecord<S>) -> Result<(), Error> {
        self.store
            .put(
                &keys::message(&record.message_id),
                encode(&MessageRow::from_record(record))?,
            )
            .await
    }

    pub async fn retrieve(
        &self,
        message_id: &S::MessageId,
    ) -> Result<Option<MessageRecord<S>>, Error> {
        match self.store.get(&keys::message(message_id)).await? {
            None => Ok(None),
            Some(raw) => {
                let row: MessageRow = decode(&raw)?;
                Ok(Some(row.into_record(message_id.clone())))
            }
        }
    }
}
