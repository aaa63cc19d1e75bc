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

use futures::stream::{self, StreamExt, TryStreamExt};
use log::warn;

use super::defs::MessageMapper;
use crate::model::*;
use crate::support::error::Error;

impl<S: IdScheme> MessageMapper<S> {
    /// Load the messages of `mailbox` within `range`, in ascending UID order.
    ///
    /// A placement whose message row cannot be found is logged and left out.
    pub async fn find_in_mailbox(
        &self,
        mailbox: &Mailbox<S>,
        range: UidRange,
        fetch: FetchType,
    ) -> Result<Vec<MailboxMessage<S>>, Error> {
        let placements =
            self.placements.list_range(&mailbox.id, range, None).await?;
        self.load_messages(placements, fetch).await
    }

    /// Load every placement of each of `message_ids`, in whichever mailbox
    /// it lives.
    ///
    /// Results are grouped by message id in the order given; ids with no
    /// placement contribute nothing.
    pub async fn retrieve_messages(
        &self,
        message_ids: &[S::MessageId],
        fetch: FetchType,
    ) -> Result<Vec<MailboxMessage<S>>, Error> {
        let placements = stream::iter(message_ids)
            .map(|id| self.placements.retrieve_by_message_id(id, None))
            .buffered(self.config.concurrency)
            .try_concat()
            .await?;
        self.load_messages(placements, fetch).await
    }

    /// Return the header and body of `record`.
    pub async fn load_content(
        &self,
        record: &MessageRecord<S>,
    ) -> Result<(Vec<u8>, Vec<u8>), Error> {
        futures::try_join!(
            self.content.get(&record.header_content),
            self.content.get(&record.body_content),
        )
    }

    async fn load_messages(
        &self,
        placements: Vec<ComposedMessageIdWithMetaData<S>>,
        fetch: FetchType,
    ) -> Result<Vec<MailboxMessage<S>>, Error> {
        let loaded = stream::iter(placements)
            .map(|placement| self.load_message(placement, fetch))
            .buffered(self.config.concurrency)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(loaded.into_iter().flatten().collect())
    }

    async fn load_message(
        &self,
        placement: ComposedMessageIdWithMetaData<S>,
        fetch: FetchType,
    ) -> Result<Option<MailboxMessage<S>>, Error> {
        let record = match self.messages.retrieve(placement.message_id()).await?
        {
            Some(record) => record,
            None => {
                warn!(
                    "{} Placement {}/{} refers to missing message {}",
                    self.log_prefix,
                    placement.mailbox_id(),
                    placement.uid(),
                    placement.message_id()
                );
                return Ok(None);
            }
        };

        let content = match fetch {
            FetchType::Metadata => None,
            FetchType::Full => Some(self.load_content(&record).await?),
        };

        Ok(Some(MailboxMessage {
            placement,
            record,
            content,
        }))
    }
}
