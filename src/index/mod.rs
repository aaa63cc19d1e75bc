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

//! The aggregate indexes derived from the placements of a mailbox.
//!
//! None of these are authoritative. They are maintained incrementally by
//! `IndexTableHandler` after each primary mutation, and a failure to update
//! them is reported but neither retried nor rolled back.

use std::sync::Arc;

use log::{error, warn};
use serde::{de::DeserializeOwned, Serialize};

use crate::flags::Flags;
use crate::model::*;
use crate::storage::rows::{decode, encode};
use crate::storage::KvStore;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::retry::RetryPolicy;

pub mod applicable_flags;
pub mod counters;
pub mod first_unseen;
pub mod recent;

use self::applicable_flags::ApplicableFlagsIndex;
use self::counters::CountersIndex;
use self::first_unseen::FirstUnseenIndex;
use self::recent::RecentIndex;

/// Updates every aggregate index in response to changes of placements.
///
/// The sub-updates of each event are independent writes to different rows.
/// They all run concurrently and are joined before returning; if any fail,
/// the rest still complete and the first error is returned.
#[derive(Clone)]
pub struct IndexTableHandler {
    pub counters: CountersIndex,
    pub recent: RecentIndex,
    pub first_unseen: FirstUnseenIndex,
    pub applicable_flags: ApplicableFlagsIndex,
    log_prefix: LogPrefix,
}

impl IndexTableHandler {
    pub fn new(
        store: Arc<dyn KvStore>,
        policy: RetryPolicy,
        log_prefix: LogPrefix,
    ) -> Self {
        IndexTableHandler {
            counters: CountersIndex::new(
                Arc::clone(&store),
                policy,
                log_prefix.clone(),
            ),
            recent: RecentIndex::new(Arc::clone(&store)),
            first_unseen: FirstUnseenIndex::new(
                Arc::clone(&store),
                policy,
                log_prefix.clone(),
            ),
            applicable_flags: ApplicableFlagsIndex::new(
                store,
                policy,
                log_prefix.clone(),
            ),
            log_prefix,
        }
    }

    /// Account for the new placement `state`.
    pub async fn on_add<S: IdScheme>(
        &self,
        state: &ComposedMessageIdWithMetaData<S>,
    ) -> Result<(), Error> {
        let mailbox = state.mailbox_id();
        let uid = state.uid();
        let flags = &state.flags;
        let unseen = !flags.is_seen();

        let (counters, recent, first_unseen, applicable) = futures::join!(
            self.counters.apply(mailbox, 1, if unseen { 1 } else { 0 }),
            async {
                if flags.is_recent() {
                    self.recent.add(mailbox, uid).await
                } else {
                    Ok(())
                }
            },
            async {
                if unseen {
                    self.first_unseen.lower_to(mailbox, uid).await
                } else {
                    Ok(())
                }
            },
            self.applicable_flags.union(mailbox, flags),
        );

        self.settle(
            "add",
            mailbox,
            uid,
            vec![
                ("counters", counters),
                ("recent", recent),
                ("first unseen", first_unseen),
                ("applicable flags", applicable),
            ],
        )
    }

    /// Account for the removal of the placement `state`.
    ///
    /// Applicable flags are left as they are.
    pub async fn on_delete<S: IdScheme>(
        &self,
        state: &ComposedMessageIdWithMetaData<S>,
    ) -> Result<(), Error> {
        let mailbox = state.mailbox_id();
        let uid = state.uid();
        let unseen = !state.flags.is_seen();

        let (counters, recent, first_unseen) = futures::join!(
            self.counters.apply(mailbox, -1, if unseen { -1 } else { 0 }),
            self.recent.remove(mailbox, uid),
            async {
                if unseen {
                    self.first_unseen.advance_past(mailbox, uid).await
                } else {
                    Ok(())
                }
            },
        );

        self.settle(
            "delete",
            mailbox,
            uid,
            vec![
                ("counters", counters),
                ("recent", recent),
                ("first unseen", first_unseen),
            ],
        )
    }

    /// Account for the flags of `uid` changing from `old` to `new`.
    pub async fn on_flags_update(
        &self,
        mailbox: &impl Identifier,
        uid: Uid,
        old: &Flags,
        new: &Flags,
    ) -> Result<(), Error> {
        if old == new {
            return Ok(());
        }

        let unseen_delta = match (old.is_seen(), new.is_seen()) {
            (true, false) => 1,
            (false, true) => -1,
            _ => 0,
        };

        let (counters, recent, first_unseen, applicable) = futures::join!(
            self.counters.apply(mailbox, 0, unseen_delta),
            async {
                match (old.is_recent(), new.is_recent()) {
                    (false, true) => self.recent.add(mailbox, uid).await,
                    (true, false) => self.recent.remove(mailbox, uid).await,
                    _ => Ok(()),
                }
            },
            async {
                match unseen_delta {
                    1 => self.first_unseen.lower_to(mailbox, uid).await,
                    -1 => self.first_unseen.advance_past(mailbox, uid).await,
                    _ => Ok(()),
                }
            },
            self.applicable_flags.union(mailbox, new),
        );

        self.settle(
            "flags update",
            mailbox,
            uid,
            vec![
                ("counters", counters),
                ("recent", recent),
                ("first unseen", first_unseen),
                ("applicable flags", applicable),
            ],
        )
    }

    /// Remove every aggregate row of `mailbox`.
    pub async fn drop_mailbox(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<(), Error> {
        let (counters, recent, first_unseen, applicable) = futures::join!(
            self.counters.drop_mailbox(mailbox),
            self.recent.drop_mailbox(mailbox),
            self.first_unseen.drop_mailbox(mailbox),
            self.applicable_flags.drop_mailbox(mailbox),
        );

        let mut first_error = None;
        for (index, result) in vec![
            ("counters", counters),
            ("recent", recent),
            ("first unseen", first_unseen),
            ("applicable flags", applicable),
        ] {
            if let Err(e) = result {
                error!(
                    "{} Failed to drop {} index of {}: {}",
                    self.log_prefix, index, mailbox, e
                );
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn settle(
        &self,
        event: &str,
        mailbox: &impl Identifier,
        uid: Uid,
        results: Vec<(&'static str, Result<(), Error>)>,
    ) -> Result<(), Error> {
        let mut first_error = None;
        for (index, result) in results {
            if let Err(e) = result {
                error!(
                    "{} Failed to update {} index for {} of {}/{}: {}",
                    self.log_prefix, index, event, mailbox, uid, e
                );
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// What a read-modify-write of an aggregate row decided to do.
pub(crate) enum RowUpdate<T> {
    Keep,
    Set(T),
    Remove,
}

/// Apply `update` to the row at `key` with a compare-and-swap loop.
///
/// `update` is called again with the fresh value after every lost race, and
/// so must be a pure function of its input.
pub(crate) async fn update_row<T, F>(
    store: &dyn KvStore,
    policy: &RetryPolicy,
    log_prefix: &LogPrefix,
    key: &[u8],
    what: &'static str,
    update: F,
) -> Result<(), Error>
where
    T: Serialize + DeserializeOwned,
    F: Fn(Option<T>) -> RowUpdate<T>,
{
    let update = &update;
    let done = policy
        .run_cas(move |_| async move {
            let current_raw = store.get(key).await?;
            let current = current_raw.as_deref().map(decode::<T>).transpose()?;
            let new = match update(current) {
                RowUpdate::Keep => return Ok(Some(())),
                RowUpdate::Remove if current_raw.is_none() => {
                    return Ok(Some(()))
                }
                RowUpdate::Remove => None,
                RowUpdate::Set(value) => Some(encode(&value)?),
            };

            let condition =
                move |stored: Option<&[u8]>| stored == current_raw.as_deref();
            Ok(if store.compare_and_swap(key, &condition, new).await? {
                Some(())
            } else {
                None
            })
        })
        .await?;

    match done {
        Some(()) => Ok(()),
        None => {
            warn!(
                "{} Gave up updating {} after {} attempts",
                log_prefix,
                what,
                policy.max_retries()
            );
            Err(Error::ContentionExhausted(what, policy.max_retries()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::keys;
    use crate::storage::memory::MemoryStore;
    use crate::support::retry::Backoff;

    fn state(
        uid: u32,
        flags: &[&str],
    ) -> ComposedMessageIdWithMetaData<NumericIds> {
        ComposedMessageIdWithMetaData {
            composed: ComposedMessageId {
                mailbox_id: 1,
                message_id: 100 + u64::from(uid),
                uid: Uid::u(uid),
            },
            flags: Flags::f(flags),
            mod_seq: Modseq::u(u64::from(uid)),
        }
    }

    fn handler(kv: Arc<MemoryStore>) -> IndexTableHandler {
        IndexTableHandler::new(
            kv,
            RetryPolicy::new(1000, Backoff::None).unwrap(),
            LogPrefix::default(),
        )
    }

    #[tokio::test]
    async fn add_update_delete() {
        let handler = handler(Arc::new(MemoryStore::new()));

        handler
            .on_add(&state(1, &["\\Recent", "$Custom"]))
            .await
            .unwrap();
        handler.on_add(&state(2, &["\\Seen"])).await.unwrap();
        assert_eq!(
            MailboxCounters {
                count: 2,
                unseen: 1
            },
            handler.counters.get(&1u64).await.unwrap()
        );
        assert_eq!(vec![Uid::u(1)], handler.recent.list(&1u64).await.unwrap());
        assert_eq!(
            Some(Uid::u(1)),
            handler.first_unseen.get(&1u64).await.unwrap()
        );

        handler
            .on_flags_update(
                &1u64,
                Uid::u(2),
                &Flags::f(&["\\Seen"]),
                &Flags::f(&["\\Flagged"]),
            )
            .await
            .unwrap();
        assert_eq!(
            MailboxCounters {
                count: 2,
                unseen: 2
            },
            handler.counters.get(&1u64).await.unwrap()
        );
        assert_eq!(
            Flags::f(&["\\Recent", "$Custom", "\\Seen", "\\Flagged"]),
            handler.applicable_flags.get(&1u64).await.unwrap()
        );

        handler
            .on_delete(&state(1, &["\\Recent", "$Custom"]))
            .await
            .unwrap();
        assert_eq!(
            MailboxCounters {
                count: 1,
                unseen: 1
            },
            handler.counters.get(&1u64).await.unwrap()
        );
        assert!(handler.recent.list(&1u64).await.unwrap().is_empty());
        // No placement rows exist here, so the scan finds nothing
        assert_eq!(None, handler.first_unseen.get(&1u64).await.unwrap());
        assert!(handler
            .applicable_flags
            .get(&1u64)
            .await
            .unwrap()
            .contains(&"$Custom".parse().unwrap()));

        handler.drop_mailbox(&1u64).await.unwrap();
        assert_eq!(
            MailboxCounters::default(),
            handler.counters.get(&1u64).await.unwrap()
        );
        assert!(handler.applicable_flags.get(&1u64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_failure_reports_first_error() {
        crate::init_test_log();

        let kv = Arc::new(MemoryStore::new());
        let handler = handler(Arc::clone(&kv));
        kv.fail_writes_with_prefix(vec![keys::RECENT]);

        assert_matches!(
            Err(Error::Storage(_)),
            handler.on_add(&state(1, &["\\Recent"])).await
        );

        // The other sub-updates still went through
        assert_eq!(
            MailboxCounters {
                count: 1,
                unseen: 1
            },
            handler.counters.get(&1u64).await.unwrap()
        );
        assert_eq!(
            Some(Uid::u(1)),
            handler.first_unseen.get(&1u64).await.unwrap()
        );
    }

    #[tokio::test]
    async fn unchanged_flags_write_nothing() {
        let kv = Arc::new(MemoryStore::new());
        let handler = handler(Arc::clone(&kv));
        let flags = Flags::f(&["\\Seen"]);
        handler
            .on_flags_update(&1u64, Uid::u(1), &flags, &flags)
            .await
            .unwrap();
        assert_eq!(0, kv.count_with_prefix(&[]));
    }
}
