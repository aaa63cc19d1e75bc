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

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use log::{error, info, warn};

use super::defs::MessageMapper;
use crate::model::*;
use crate::support::error::Error;

impl<S: IdScheme> MessageMapper<S> {
    /// Remove the placement at `uid` from `mailbox`.
    ///
    /// Returns the state the placement had when it was removed, or `None` if
    /// there was nothing to remove. Removing a placement twice, even
    /// concurrently, updates the aggregates only once. The message row and
    /// content stay where they are.
    pub async fn delete(
        &self,
        mailbox: &Mailbox<S>,
        uid: Uid,
    ) -> Result<Option<ComposedMessageIdWithMetaData<S>>, Error> {
        self.delete_placement(&mailbox.id, uid).await
    }

    /// Remove every placement in `uids`, returning those that were removed.
    ///
    /// All deletions are attempted even if some fail, in which case the first
    /// error is returned.
    pub async fn delete_messages(
        &self,
        mailbox: &Mailbox<S>,
        uids: &[Uid],
    ) -> Result<BTreeMap<Uid, MessageMetaData<S>>, Error> {
        self.delete_many(mailbox, uids, false).await
    }

    /// Return the UIDs within `range` whose placements carry `\Deleted`.
    pub async fn find_marked_for_deletion(
        &self,
        mailbox: &Mailbox<S>,
        range: UidRange,
    ) -> Result<Vec<Uid>, Error> {
        Ok(self
            .placements
            .list_range(&mailbox.id, range, None)
            .await?
            .into_iter()
            .filter(|p| p.flags.is_deleted())
            .map(|p| p.uid())
            .collect())
    }

    /// Remove every placement within `range` carrying `\Deleted`.
    ///
    /// A placement which loses `\Deleted` before it is removed is kept.
    pub async fn expunge_marked_for_deletion(
        &self,
        mailbox: &Mailbox<S>,
        range: UidRange,
    ) -> Result<BTreeMap<Uid, MessageMetaData<S>>, Error> {
        let uids = self.find_marked_for_deletion(mailbox, range).await?;
        let expunged = self.delete_many(mailbox, &uids, true).await?;
        info!(
            "{} Expunged {} messages from {}",
            self.log_prefix,
            expunged.len(),
            mailbox.name
        );
        Ok(expunged)
    }

    async fn delete_many(
        &self,
        mailbox: &Mailbox<S>,
        uids: &[Uid],
        only_if_deleted: bool,
    ) -> Result<BTreeMap<Uid, MessageMetaData<S>>, Error> {
        let results = stream::iter(uids.iter().copied())
            .map(|uid| async move {
                let removed = self
                    .delete_placement_if(&mailbox.id, uid, only_if_deleted)
                    .await?;
                match removed {
                    None => Ok(None),
                    Some(placement) => self.meta_data(placement).await,
                }
            })
            .buffered(self.config.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut removed = BTreeMap::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(Some(meta)) => {
                    removed.insert(meta.uid(), meta);
                }
                Ok(None) => (),
                Err(e) => {
                    error!(
                        "{} Failed to delete from {}: {}",
                        self.log_prefix, mailbox.name, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(removed),
            Some(e) => Err(e),
        }
    }

    async fn meta_data(
        &self,
        placement: ComposedMessageIdWithMetaData<S>,
    ) -> Result<Option<MessageMetaData<S>>, Error> {
        match self.messages.retrieve(placement.message_id()).await? {
            Some(record) => Ok(Some(MessageMetaData {
                placement,
                size: record.size,
                internal_date: record.internal_date,
            })),
            None => {
                warn!(
                    "{} Removed {}/{} whose message {} has no row",
                    self.log_prefix,
                    placement.mailbox_id(),
                    placement.uid(),
                    placement.message_id()
                );
                Ok(None)
            }
        }
    }

    pub(super) async fn delete_placement(
        &self,
        mailbox: &S::MailboxId,
        uid: Uid,
    ) -> Result<Option<ComposedMessageIdWithMetaData<S>>, Error> {
        self.delete_placement_if(mailbox, uid, false).await
    }

    async fn delete_placement_if(
        &self,
        mailbox: &S::MailboxId,
        uid: Uid,
        only_if_deleted: bool,
    ) -> Result<Option<ComposedMessageIdWithMetaData<S>>, Error> {
        let this = self;
        let removed = self
            .flags_policy
            .run_cas(move |_| async move {
                let mirror =
                    match this.placements.retrieve_by_uid(mailbox, uid).await? {
                        Some(mirror) => mirror,
                        None => return Ok(Some(None)),
                    };

                let current =
                    match this.placements.retrieve(&mirror.composed).await? {
                        Some(current) => current,
                        None => {
                            warn!(
                                "{} Removing orphaned placement {}/{}",
                                this.log_prefix, mailbox, uid
                            );
                            this.placements
                                .delete_orphan(&mirror.composed)
                                .await?;
                            return Ok(Some(None));
                        }
                    };

                if only_if_deleted && !current.flags.is_deleted() {
                    return Ok(Some(None));
                }

                Ok(if this.placements.delete(&current).await? {
                    Some(Some(current))
                } else {
                    None
                })
            })
            .await?;

        match removed {
            None => {
                warn!(
                    "{} Gave up deleting {}/{} after {} attempts",
                    self.log_prefix,
                    mailbox,
                    uid,
                    self.flags_policy.max_retries()
                );
                Err(Error::ContentionExhausted(
                    "delete",
                    self.flags_policy.max_retries(),
                ))
            }
            Some(None) => Ok(None),
            Some(Some(removed)) => {
                self.indexes.on_delete(&removed).await?;
                Ok(Some(removed))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::defs::TestFixture;
    use super::*;
    use crate::flags::{Flags, FlagsUpdateCalculator};
    use crate::storage::{keys, KvStore};

    #[tokio::test]
    async fn delete_is_idempotent() {
        let fixture = TestFixture::new();
        let added = fixture.add(&fixture.inbox, 100, &[]).await;
        fixture.add(&fixture.inbox, 101, &[]).await;

        assert_eq!(
            Some(added.placement.clone()),
            fixture.mapper.delete(&fixture.inbox, Uid::u(1)).await.unwrap()
        );
        assert_eq!(
            None,
            fixture.mapper.delete(&fixture.inbox, Uid::u(1)).await.unwrap()
        );
        assert_eq!(
            None,
            fixture.mapper.delete(&fixture.inbox, Uid::u(9)).await.unwrap()
        );

        let counters = fixture
            .mapper
            .get_mailbox_counters(&fixture.inbox)
            .await
            .unwrap();
        assert_eq!(1, counters.count);
        assert_eq!(1, counters.unseen);
        assert_eq!(
            Some(Uid::u(2)),
            fixture
                .mapper
                .find_first_unseen_uid(&fixture.inbox)
                .await
                .unwrap()
        );

        // Content and message rows are never removed
        assert_eq!(2, fixture.kv.count_with_prefix(&[keys::MESSAGE]));
        assert!(fixture
            .mapper
            .messages
            .retrieve(&100)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn concurrent_deletes_decrement_once() {
        let fixture = TestFixture::new();
        fixture.add(&fixture.inbox, 100, &[]).await;
        fixture.add(&fixture.inbox, 101, &[]).await;

        let (a, b, c) = futures::join!(
            fixture.mapper.delete(&fixture.inbox, Uid::u(1)),
            fixture.mapper.delete(&fixture.inbox, Uid::u(1)),
            fixture.mapper.delete(&fixture.inbox, Uid::u(1)),
        );
        let winners = [a.unwrap(), b.unwrap(), c.unwrap()]
            .iter()
            .filter(|r| r.is_some())
            .count();
        assert_eq!(1, winners);
        assert_eq!(
            1,
            fixture
                .mapper
                .get_mailbox_counters(&fixture.inbox)
                .await
                .unwrap()
                .count
        );
    }

    #[tokio::test]
    async fn counters_track_adds_and_deletes() {
        let fixture = TestFixture::new();
        for message in 0..10 {
            fixture.add(&fixture.inbox, message, &[]).await;
        }

        let removed = fixture
            .mapper
            .delete_messages(
                &fixture.inbox,
                &[Uid::u(2), Uid::u(4), Uid::u(6), Uid::u(42)],
            )
            .await
            .unwrap();
        assert_eq!(
            vec![Uid::u(2), Uid::u(4), Uid::u(6)],
            removed.keys().copied().collect::<Vec<_>>()
        );
        assert_eq!(
            7,
            fixture.mapper.count_messages(&fixture.inbox).await.unwrap()
        );
        assert_eq!(
            7,
            fixture
                .mapper
                .count_unseen_messages(&fixture.inbox)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn expunge() {
        let fixture = TestFixture::new();
        fixture.add(&fixture.inbox, 100, &["\\Deleted"]).await;
        fixture.add(&fixture.inbox, 101, &[]).await;
        fixture
            .add(&fixture.inbox, 102, &["\\Deleted", "\\Seen"])
            .await;
        fixture.add(&fixture.inbox, 103, &["\\Deleted"]).await;

        assert_eq!(
            vec![Uid::u(1), Uid::u(3), Uid::u(4)],
            fixture
                .mapper
                .find_marked_for_deletion(&fixture.inbox, UidRange::All)
                .await
                .unwrap()
        );

        let expunged = fixture
            .mapper
            .expunge_marked_for_deletion(
                &fixture.inbox,
                UidRange::Range(Uid::u(1), Uid::u(3)),
            )
            .await
            .unwrap();
        assert_eq!(
            vec![Uid::u(1), Uid::u(3)],
            expunged.keys().copied().collect::<Vec<_>>()
        );
        assert_eq!(&102, expunged[&Uid::u(3)].placement.message_id());
        assert!(expunged[&Uid::u(3)].size > 0);

        let counters = fixture
            .mapper
            .get_mailbox_counters(&fixture.inbox)
            .await
            .unwrap();
        assert_eq!(2, counters.count);
        assert_eq!(2, counters.unseen);
    }

    #[tokio::test]
    async fn expunge_keeps_undeleted() {
        let fixture = TestFixture::new();
        let added = fixture.add(&fixture.inbox, 100, &["\\Deleted"]).await;
        fixture
            .mapper
            .update_flags(
                &fixture.inbox,
                &FlagsUpdateCalculator::remove(Flags::f(&["\\Deleted"])),
                UidRange::All,
            )
            .await
            .unwrap();

        let expunged = fixture
            .mapper
            .delete_many(&fixture.inbox, &[added.uid()], true)
            .await
            .unwrap();
        assert!(expunged.is_empty());
        assert_eq!(
            1,
            fixture.mapper.count_messages(&fixture.inbox).await.unwrap()
        );
    }

    #[tokio::test]
    async fn applicable_flags_survive_deletion() {
        let fixture = TestFixture::new();
        fixture.add(&fixture.inbox, 100, &["$Custom"]).await;
        fixture.mapper.delete(&fixture.inbox, Uid::u(1)).await.unwrap();

        assert!(fixture
            .mapper
            .get_applicable_flags(&fixture.inbox)
            .await
            .unwrap()
            .contains(&"$Custom".parse().unwrap()));
    }

    #[tokio::test]
    async fn orphaned_mirror_is_cleaned_up() {
        let fixture = TestFixture::new();
        let added = fixture.add(&fixture.inbox, 100, &[]).await;
        fixture
            .kv
            .delete(&keys::by_message_id(&100u64, &1u64, Uid::u(1)))
            .await
            .unwrap();

        assert_eq!(
            None,
            fixture.mapper.delete(&fixture.inbox, added.uid()).await.unwrap()
        );
        assert!(fixture
            .mapper
            .placements
            .list_range(&1, UidRange::All, None)
            .await
            .unwrap()
            .is_empty());
    }
}
