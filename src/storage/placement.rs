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

//! The two projections of message placements.
//!
//! Every placement is stored twice: in `BY_MAILBOX_UID`, which serves range
//! scans within a mailbox, and in `BY_MESSAGE_ID`, which serves lookups of
//! every placement of a message and is the row flag updates compare-and-swap
//! on. The rest of the crate never sees the two tables separately.
//!
//! `BY_MESSAGE_ID` includes the UID in its key since the same message may be
//! placed in the same mailbox more than once (e.g. by copying a message into
//! its own mailbox).

use std::marker::PhantomData;
use std::sync::Arc;

use log::warn;

use super::keys::{self, KeyBuilder};
use super::rows::{decode, encode, PlacementRow};
use super::KvStore;
use crate::model::*;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

pub struct PlacementStore<S: IdScheme> {
    store: Arc<dyn KvStore>,
    log_prefix: LogPrefix,
    _ids: PhantomData<S>,
}

type State<S> = ComposedMessageIdWithMetaData<S>;

impl<S: IdScheme> PlacementStore<S> {
    pub fn new(store: Arc<dyn KvStore>, log_prefix: LogPrefix) -> Self {
        PlacementStore {
            store,
            log_prefix,
            _ids: PhantomData,
        }
    }

    /// Unconditionally write both rows of `state`.
    ///
    /// `BY_MESSAGE_ID` is written first. A `BY_MAILBOX_UID` row without its
    /// `BY_MESSAGE_ID` row is thus always left over from a deletion, never
    /// the first half of an insert.
    pub async fn insert(&self, state: &State<S>) -> Result<(), Error> {
        let row = encode(&PlacementRow::from_state(state))?;
        self.store
            .put(&message_key(&state.composed), row.clone())
            .await?;
        self.store.put(&uid_key(&state.composed), row).await
    }

    /// Look up the placement at `uid` in `mailbox`.
    pub async fn retrieve_by_uid(
        &self,
        mailbox: &S::MailboxId,
        uid: Uid,
    ) -> Result<Option<State<S>>, Error> {
        self.store
            .get(&keys::by_mailbox_uid(mailbox, uid))
            .await?
            .map(|raw| decode_state(&raw))
            .transpose()
    }

    /// Read the current state of `placement` from the row flag updates
    /// serialise on.
    pub async fn retrieve(
        &self,
        placement: &ComposedMessageId<S>,
    ) -> Result<Option<State<S>>, Error> {
        self.store
            .get(&message_key(placement))
            .await?
            .map(|raw| decode_state(&raw))
            .transpose()
    }

    /// Find the placements of `message_id`, optionally only those in
    /// `mailbox`.
    pub async fn retrieve_by_message_id(
        &self,
        message_id: &S::MessageId,
        mailbox: Option<&S::MailboxId>,
    ) -> Result<Vec<State<S>>, Error> {
        let prefix = KeyBuilder::new(keys::BY_MESSAGE_ID).id(message_id);
        let prefix = match mailbox {
            Some(mailbox) => prefix.id(mailbox),
            None => prefix,
        }
        .build();

        self.store
            .scan(&prefix, &keys::prefix_end(&prefix), None)
            .await?
            .into_iter()
            .map(|(_, raw)| decode_state(&raw))
            .collect()
    }

    /// List the placements of `mailbox` within `range` in ascending UID
    /// order.
    pub async fn list_range(
        &self,
        mailbox: &S::MailboxId,
        range: UidRange,
        limit: Option<usize>,
    ) -> Result<Vec<State<S>>, Error> {
        let (first, last) = range.bounds();
        let (start, end) =
            keys::uid_span(keys::BY_MAILBOX_UID, mailbox, first, last);
        self.store
            .scan(&start, &end, limit)
            .await?
            .into_iter()
            .map(|(_, raw)| decode_state(&raw))
            .collect()
    }

    /// Write `new_state` if the placement still has `expected` as its modseq.
    ///
    /// Returns `false` without writing anything if it does not, including if
    /// the placement no longer exists. On success, the `BY_MAILBOX_UID` row is
    /// then overwritten to match; if that write fails the two rows disagree
    /// until the next successful update of the placement, and the error is
    /// returned.
    pub async fn cas_update_flags(
        &self,
        new_state: &State<S>,
        expected: Modseq,
    ) -> Result<bool, Error> {
        let row = encode(&PlacementRow::from_state(new_state))?;
        let condition = mod_seq_is(expected);

        if !self
            .store
            .compare_and_swap(
                &message_key(&new_state.composed),
                &condition,
                Some(row.clone()),
            )
            .await?
        {
            return Ok(false);
        }

        if let Err(e) =
            self.store.put(&uid_key(&new_state.composed), row).await
        {
            warn!(
                "{} Flags of {}/{} updated to {:?} but mirror write failed: {}",
                self.log_prefix,
                new_state.mailbox_id(),
                new_state.uid(),
                new_state.mod_seq,
                e,
            );
            return Err(e);
        }

        Ok(true)
    }

    /// Remove both rows of `state`, provided the placement still has the
    /// modseq of `state`.
    ///
    /// Returns whether this call removed the placement. Of several concurrent
    /// deletions of the same placement, exactly one gets `true`. The
    /// `BY_MESSAGE_ID` row goes first so that racing flag updates stop as
    /// early as possible.
    pub async fn delete(&self, state: &State<S>) -> Result<bool, Error> {
        let condition = mod_seq_is(state.mod_seq);
        if !self
            .store
            .compare_and_swap(&message_key(&state.composed), &condition, None)
            .await?
        {
            return Ok(false);
        }

        self.store.delete(&uid_key(&state.composed)).await?;
        Ok(true)
    }

    /// Remove the `BY_MAILBOX_UID` row of a placement whose `BY_MESSAGE_ID`
    /// row is already gone, i.e., one whose deletion was interrupted.
    pub async fn delete_orphan(
        &self,
        placement: &ComposedMessageId<S>,
    ) -> Result<(), Error> {
        self.store.delete(&uid_key(placement)).await
    }
}

fn mod_seq_is(
    expected: Modseq,
) -> impl Fn(Option<&[u8]>) -> bool + Send + Sync {
    move |stored: Option<&[u8]>| {
        stored
            .and_then(|raw| decode::<PlacementRow>(raw).ok())
            .map_or(false, |current| expected == current.mod_seq)
    }
}

fn uid_key<S: IdScheme>(placement: &ComposedMessageId<S>) -> Vec<u8> {
    keys::by_mailbox_uid(&placement.mailbox_id, placement.uid)
}

fn message_key<S: IdScheme>(placement: &ComposedMessageId<S>) -> Vec<u8> {
    keys::by_message_id(
        &placement.message_id,
        &placement.mailbox_id,
        placement.uid,
    )
}

fn decode_state<S: IdScheme>(raw: &[u8]) -> Result<State<S>, Error> {
    decode::<PlacementRow>(raw)?.into_state()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flags::Flags;
    use crate::storage::memory::MemoryStore;

    fn state(
        mailbox: u64,
        message: u64,
        uid: u32,
        mod_seq: u64,
        flags: &[&str],
    ) -> State<NumericIds> {
        ComposedMessageIdWithMetaData {
            composed: ComposedMessageId {
                mailbox_id: mailbox,
                message_id: message,
                uid: Uid::u(uid),
            },
            flags: Flags::f(flags),
            mod_seq: Modseq::u(mod_seq),
        }
    }

    fn placements(kv: Arc<MemoryStore>) -> PlacementStore<NumericIds> {
        PlacementStore::new(kv, LogPrefix::default())
    }

    #[tokio::test]
    async fn insert_and_lookup() {
        let store = placements(Arc::new(MemoryStore::new()));
        let a = state(1, 100, 1, 1, &["\\Seen"]);
        let b = state(2, 100, 7, 3, &[]);
        let c = state(1, 101, 2, 2, &["$Custom"]);
        for s in &[&a, &b, &c] {
            store.insert(s).await.unwrap();
        }

        assert_eq!(
            Some(a.clone()),
            store.retrieve_by_uid(&1, Uid::u(1)).await.unwrap()
        );
        assert_eq!(None, store.retrieve_by_uid(&1, Uid::u(3)).await.unwrap());
        assert_eq!(
            vec![a.clone(), b.clone()],
            store.retrieve_by_message_id(&100, None).await.unwrap()
        );
        assert_eq!(
            vec![b.clone()],
            store.retrieve_by_message_id(&100, Some(&2)).await.unwrap()
        );
        assert_eq!(
            vec![a.clone(), c.clone()],
            store.list_range(&1, UidRange::All, None).await.unwrap()
        );
        assert_eq!(
            vec![c.clone()],
            store
                .list_range(&1, UidRange::From(Uid::u(2)), None)
                .await
                .unwrap()
        );
        assert_eq!(
            vec![a.clone()],
            store.list_range(&1, UidRange::All, Some(1)).await.unwrap()
        );
        assert_eq!(
            Some(b.clone()),
            store.retrieve(&b.composed).await.unwrap()
        );
    }

    #[tokio::test]
    async fn insert_writes_message_row_first() {
        let kv = Arc::new(MemoryStore::new());
        let store = placements(kv.clone());
        let a = state(1, 100, 1, 1, &[]);

        kv.fail_writes_with_prefix(vec![keys::BY_MESSAGE_ID]);
        assert_matches!(Err(Error::Storage(_)), store.insert(&a).await);
        assert_eq!(0, kv.count_with_prefix(&[keys::BY_MAILBOX_UID]));

        kv.clear_failures();
        kv.fail_writes_with_prefix(vec![keys::BY_MAILBOX_UID]);
        assert_matches!(Err(Error::Storage(_)), store.insert(&a).await);
        assert_eq!(Some(a.clone()), store.retrieve(&a.composed).await.unwrap());
        assert_eq!(None, store.retrieve_by_uid(&1, Uid::u(1)).await.unwrap());
    }

    #[tokio::test]
    async fn cas_conditioned_on_modseq() {
        let store = placements(Arc::new(MemoryStore::new()));
        let original = state(1, 100, 1, 1, &[]);
        store.insert(&original).await.unwrap();

        let seen = state(1, 100, 1, 2, &["\\Seen"]);
        assert!(!store.cas_update_flags(&seen, Modseq::u(5)).await.unwrap());
        assert_eq!(
            Some(original.clone()),
            store.retrieve_by_uid(&1, Uid::u(1)).await.unwrap()
        );

        assert!(store.cas_update_flags(&seen, Modseq::u(1)).await.unwrap());
        assert_eq!(
            Some(seen.clone()),
            store.retrieve_by_uid(&1, Uid::u(1)).await.unwrap()
        );
        assert_eq!(
            Some(seen.clone()),
            store.retrieve(&seen.composed).await.unwrap()
        );

        // The old modseq no longer matches
        let flagged = state(1, 100, 1, 3, &["\\Flagged"]);
        assert!(!store.cas_update_flags(&flagged, Modseq::u(1)).await.unwrap());
    }

    #[tokio::test]
    async fn cas_on_deleted_placement_fails() {
        let store = placements(Arc::new(MemoryStore::new()));
        let original = state(1, 100, 1, 1, &[]);
        store.insert(&original).await.unwrap();
        assert!(!store.delete(&state(1, 100, 1, 9, &[])).await.unwrap());
        assert!(store.delete(&original).await.unwrap());
        assert!(!store.delete(&original).await.unwrap());

        assert!(!store
            .cas_update_flags(&state(1, 100, 1, 2, &["\\Seen"]), Modseq::u(1))
            .await
            .unwrap());
        assert_eq!(None, store.retrieve_by_uid(&1, Uid::u(1)).await.unwrap());
        assert!(store
            .retrieve_by_message_id(&100, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn mirror_failure_is_reported() {
        crate::init_test_log();

        let kv = Arc::new(MemoryStore::new());
        let store = placements(kv.clone());
        let original = state(1, 100, 1, 1, &[]);
        store.insert(&original).await.unwrap();

        kv.fail_writes_with_prefix(vec![keys::BY_MAILBOX_UID]);
        let seen = state(1, 100, 1, 2, &["\\Seen"]);
        assert_matches!(
            Err(Error::Storage(_)),
            store.cas_update_flags(&seen, Modseq::u(1)).await
        );

        // The authoritative row has moved on; the mirror lags behind
        assert_eq!(
            Some(seen.clone()),
            store.retrieve(&seen.composed).await.unwrap()
        );
        assert_eq!(
            Some(original),
            store.retrieve_by_uid(&1, Uid::u(1)).await.unwrap()
        );
    }
}
