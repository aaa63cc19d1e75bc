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

use log::{info, warn};

use super::defs::MessageMapper;
use crate::flags::Flag;
use crate::model::*;
use crate::support::error::Error;

impl<S: IdScheme> MessageMapper<S> {
    /// Add a new message to `mailbox`.
    ///
    /// A UID and a modseq are allocated first, then the content and the
    /// message row are written, and only then the placement. If anything
    /// before the placement fails, the mailbox is left as it was apart from
    /// the allocated numbers never being used.
    pub async fn add(
        &self,
        mailbox: &Mailbox<S>,
        draft: MessageDraft<S>,
    ) -> Result<MessageMetaData<S>, Error> {
        let (uid, mod_seq) = self.allocate(&mailbox.id).await?;

        let (header_content, body_content) = futures::try_join!(
            self.content.put(&draft.header),
            self.content.put(&draft.body),
        )?;

        let header_len = draft.header.len() as u64;
        let record = MessageRecord {
            message_id: draft.message_id,
            internal_date: draft.internal_date,
            size: header_len + draft.body.len() as u64,
            body_start: header_len,
            header_content,
            body_content,
            attachments: draft.attachments,
        };
        self.messages.insert(&record).await?;

        let placement = ComposedMessageIdWithMetaData {
            composed: ComposedMessageId {
                mailbox_id: mailbox.id.clone(),
                message_id: record.message_id.clone(),
                uid,
            },
            flags: draft.flags,
            mod_seq,
        };
        self.publish(&placement).await?;

        info!(
            "{} Added {} to {} as {}",
            self.log_prefix, record.message_id, mailbox.name, uid
        );

        Ok(MessageMetaData {
            placement,
            size: record.size,
            internal_date: record.internal_date,
        })
    }

    /// Place the message of `original` into `destination` as well.
    ///
    /// The copy shares the content of the original and gets a new UID and
    /// modseq. Its flags are those of `original` plus `\Recent`.
    pub async fn copy(
        &self,
        destination: &Mailbox<S>,
        original: &ComposedMessageIdWithMetaData<S>,
    ) -> Result<MessageMetaData<S>, Error> {
        let record = self
            .messages
            .retrieve(original.message_id())
            .await?
            .ok_or(Error::NxMessage)?;
        let (uid, mod_seq) = self.allocate(&destination.id).await?;

        let placement = ComposedMessageIdWithMetaData {
            composed: ComposedMessageId {
                mailbox_id: destination.id.clone(),
                message_id: original.message_id().clone(),
                uid,
            },
            flags: original.flags.clone().with(Flag::Recent),
            mod_seq,
        };
        self.publish(&placement).await?;

        info!(
            "{} Copied {}/{} to {} as {}",
            self.log_prefix,
            original.mailbox_id(),
            original.uid(),
            destination.name,
            uid
        );

        Ok(MessageMetaData {
            placement,
            size: record.size,
            internal_date: record.internal_date,
        })
    }

    /// Move the message of `original` into `destination`.
    ///
    /// This is a copy followed by a delete of `original`. If the delete
    /// fails, the message is left in both mailboxes and the error returned.
    pub async fn move_message(
        &self,
        destination: &Mailbox<S>,
        original: &ComposedMessageIdWithMetaData<S>,
    ) -> Result<MessageMetaData<S>, Error> {
        let moved = self.copy(destination, original).await?;
        if let Err(e) = self
            .delete_placement(original.mailbox_id(), original.uid())
            .await
        {
            warn!(
                "{} Moved {}/{} to {} but could not remove the original: {}",
                self.log_prefix,
                original.mailbox_id(),
                original.uid(),
                destination.name,
                e
            );
            return Err(e);
        }

        Ok(moved)
    }

    async fn allocate(
        &self,
        mailbox: &S::MailboxId,
    ) -> Result<(Uid, Modseq), Error> {
        let uid = self.sequences.next_uid(mailbox).await?;
        let mod_seq = self.sequences.next_mod_seq(mailbox).await?;
        Ok((uid, mod_seq))
    }

    /// Write both rows of a new placement, then update the aggregates.
    async fn publish(
        &self,
        placement: &ComposedMessageIdWithMetaData<S>,
    ) -> Result<(), Error> {
        self.placements.insert(placement).await?;
        self.indexes.on_add(placement).await
    }
}

#[cfg(test)]
mod test {
    use super::super::defs::TestFixture;
    use super::*;
    use crate::flags::Flags;
    use crate::storage::keys;

    #[tokio::test]
    async fn add_allocates_and_indexes() {
        let fixture = TestFixture::new();
        let first = fixture.add(&fixture.inbox, 100, &["\\Seen"]).await;
        let second = fixture.add(&fixture.inbox, 101, &["$Custom"]).await;

        assert_eq!(Uid::u(1), first.uid());
        assert_eq!(Modseq::u(1), first.mod_seq());
        assert_eq!(Uid::u(2), second.uid());
        assert_eq!(Modseq::u(2), second.mod_seq());

        let draft = fixture.draft(100, &[]);
        assert_eq!(
            (draft.header.len() + draft.body.len()) as u64,
            first.size
        );

        let stored = fixture
            .mapper
            .placements
            .retrieve_by_uid(&1, Uid::u(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.placement, stored);
        assert_eq!(Flags::f(&["\\Seen"]), stored.flags);

        let counters = fixture
            .mapper
            .get_mailbox_counters(&fixture.inbox)
            .await
            .unwrap();
        assert_eq!(2, counters.count);
        assert_eq!(1, counters.unseen);
        assert_eq!(
            Some(Uid::u(2)),
            fixture
                .mapper
                .find_first_unseen_uid(&fixture.inbox)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn content_failure_leaves_no_placement() {
        let fixture = TestFixture::new();
        fixture
            .kv
            .fail_writes_with_prefix(vec![keys::BLOB_DESCRIPTOR]);

        assert_matches!(
            Err(Error::Storage(_)),
            fixture.mapper.add(&fixture.inbox, fixture.draft(100, &[])).await
        );
        assert_eq!(0, fixture.kv.count_with_prefix(&[keys::BY_MAILBOX_UID]));
        assert_eq!(0, fixture.kv.count_with_prefix(&[keys::BY_MESSAGE_ID]));
        assert_eq!(0, fixture.kv.count_with_prefix(&[keys::COUNTERS]));
        assert_eq!(0, fixture.kv.count_with_prefix(&[keys::MESSAGE]));

        // The allocated numbers are gone for good
        fixture.kv.clear_failures();
        let added = fixture.add(&fixture.inbox, 100, &[]).await;
        assert_eq!(Uid::u(2), added.uid());
        assert_eq!(Modseq::u(2), added.mod_seq());
    }

    #[tokio::test]
    async fn copy_shares_content() {
        let fixture = TestFixture::new();
        let original = fixture.add(&fixture.inbox, 100, &["\\Seen"]).await;
        fixture.add(&fixture.archive, 200, &[]).await;

        let blobs = fixture.kv.count_with_prefix(&[keys::BLOB_CHUNK]);
        let copy = fixture
            .mapper
            .copy(&fixture.archive, &original.placement)
            .await
            .unwrap();
        assert_eq!(blobs, fixture.kv.count_with_prefix(&[keys::BLOB_CHUNK]));

        assert_eq!(Uid::u(2), copy.uid());
        assert_eq!(Modseq::u(2), copy.mod_seq());
        assert_eq!(&100, copy.placement.message_id());
        assert_eq!(Flags::f(&["\\Seen", "\\Recent"]), copy.placement.flags);
        assert_eq!(original.size, copy.size);
        assert_eq!(original.internal_date, copy.internal_date);

        // The original is untouched
        assert_eq!(
            Some(original.placement.clone()),
            fixture
                .mapper
                .placements
                .retrieve_by_uid(&1, Uid::u(1))
                .await
                .unwrap()
        );
        assert_eq!(
            2,
            fixture
                .mapper
                .placements
                .retrieve_by_message_id(&100, None)
                .await
                .unwrap()
                .len()
        );
        assert_eq!(
            vec![Uid::u(2)],
            fixture
                .mapper
                .find_recent_uids(&fixture.archive)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn copy_into_same_mailbox() {
        let fixture = TestFixture::new();
        let original = fixture.add(&fixture.inbox, 100, &[]).await;
        let copy = fixture
            .mapper
            .copy(&fixture.inbox, &original.placement)
            .await
            .unwrap();
        assert_eq!(Uid::u(2), copy.uid());
        assert_eq!(
            2,
            fixture
                .mapper
                .placements
                .retrieve_by_message_id(&100, Some(&1))
                .await
                .unwrap()
                .len()
        );
    }

    #[tokio::test]
    async fn copy_of_unknown_message() {
        let fixture = TestFixture::new();
        let mut phantom = fixture.add(&fixture.inbox, 100, &[]).await.placement;
        phantom.composed.message_id = 999;
        assert_matches!(
            Err(Error::NxMessage),
            fixture.mapper.copy(&fixture.archive, &phantom).await
        );
    }

    #[tokio::test]
    async fn move_removes_original() {
        let fixture = TestFixture::new();
        let original = fixture.add(&fixture.inbox, 100, &[]).await;
        let moved = fixture
            .mapper
            .move_message(&fixture.archive, &original.placement)
            .await
            .unwrap();

        assert_eq!(&2, moved.placement.mailbox_id());
        assert_eq!(
            None,
            fixture
                .mapper
                .placements
                .retrieve_by_uid(&1, Uid::u(1))
                .await
                .unwrap()
        );
        assert_eq!(
            0,
            fixture
                .mapper
                .get_mailbox_counters(&fixture.inbox)
                .await
                .unwrap()
                .count
        );
        assert_eq!(
            1,
            fixture
                .mapper
                .get_mailbox_counters(&fixture.archive)
                .await
                .unwrap()
                .count
        );
    }

    #[tokio::test]
    async fn failed_move_leaves_message_in_both() {
        let fixture = TestFixture::new();
        let original = fixture.add(&fixture.inbox, 100, &[]).await;

        // Copies only write BY_MESSAGE_ID rows for the destination, but
        // deleting the original needs a CAS on its own row.
        let mut prefix = vec![keys::BY_MESSAGE_ID];
        prefix.extend_from_slice(&(8u16).to_be_bytes());
        prefix.extend_from_slice(&100u64.to_be_bytes());
        prefix.extend_from_slice(&(8u16).to_be_bytes());
        prefix.extend_from_slice(&1u64.to_be_bytes());
        fixture.kv.fail_writes_with_prefix(prefix);

        assert_matches!(
            Err(Error::Storage(_)),
            fixture
                .mapper
                .move_message(&fixture.archive, &original.placement)
                .await
        );
        assert!(fixture
            .mapper
            .placements
            .retrieve_by_uid(&1, Uid::u(1))
            .await
            .unwrap()
            .is_some());
        assert!(fixture
            .mapper
            .placements
            .retrieve_by_uid(&2, Uid::u(1))
            .await
            .unwrap()
            .is_some());
    }
}
