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

use std::sync::Arc;

use super::{update_row, RowUpdate};
use crate::model::{Identifier, MailboxCounters};
use crate::storage::keys;
use crate::storage::rows::decode;
use crate::storage::KvStore;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::retry::RetryPolicy;

/// The message and unseen counts of each mailbox.
///
/// Both counts saturate at zero rather than going negative if decrements
/// arrive for messages whose increments were lost.
#[derive(Clone)]
pub struct CountersIndex {
    store: Arc<dyn KvStore>,
    policy: RetryPolicy,
    log_prefix: LogPrefix,
}

impl CountersIndex {
    pub fn new(
        store: Arc<dyn KvStore>,
        policy: RetryPolicy,
        log_prefix: LogPrefix,
    ) -> Self {
        CountersIndex {
            store,
            policy,
            log_prefix,
        }
    }

    pub async fn get(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<MailboxCounters, Error> {
        match self.store.get(&keys::counters(mailbox)).await? {
            Some(raw) => decode(&raw),
            None => Ok(MailboxCounters::default()),
        }
    }

    /// Add the given deltas to the counters of `mailbox`.
    pub async fn apply(
        &self,
        mailbox: &impl Identifier,
        count_delta: i64,
        unseen_delta: i64,
    ) -> Result<(), Error> {
        if 0 == count_delta && 0 == unseen_delta {
            return Ok(());
        }

        update_row(
            &*self.store,
            &self.policy,
            &self.log_prefix,
            &keys::counters(mailbox),
            "mailbox counters",
            |current: Option<MailboxCounters>| {
                let current = current.unwrap_or_default();
                let new = MailboxCounters {
                    count: offset(current.count, count_delta),
                    unseen: offset(current.unseen, unseen_delta),
                };
                // An empty mailbox needs no row
                if MailboxCounters::default() == new {
                    RowUpdate::Remove
                } else {
                    RowUpdate::Set(new)
                }
            },
        )
        .await
    }

    pub async fn drop_mailbox(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<(), Error> {
        self.store.delete(&keys::counters(mailbox)).await
    }
}

fn offset(value: u64, delta: i64) -> u64 {
    if delta < 0 {
        value.saturating_sub(delta.unsigned_abs())
    } else {
        value.saturating_add(delta as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::support::retry::Backoff;

    fn index() -> CountersIndex {
        CountersIndex::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy::new(10_000, Backoff::None).unwrap(),
            LogPrefix::default(),
        )
    }

    #[tokio::test]
    async fn absent_counters_are_zero() {
        let index = index();
        assert_eq!(MailboxCounters::default(), index.get(&1u64).await.unwrap());
    }

    #[tokio::test]
    async fn deltas_accumulate_and_saturate() {
        let index = index();
        index.apply(&1u64, 3, 2).await.unwrap();
        index.apply(&1u64, -1, 0).await.unwrap();
        assert_eq!(
            MailboxCounters {
                count: 2,
                unseen: 2
            },
            index.get(&1u64).await.unwrap()
        );

        index.apply(&1u64, -5, -5).await.unwrap();
        assert_eq!(MailboxCounters::default(), index.get(&1u64).await.unwrap());
        assert_eq!(
            None,
            index.store.get(&keys::counters(&1u64)).await.unwrap()
        );

        index.apply(&2u64, 1, 1).await.unwrap();
        index.drop_mailbox(&2u64).await.unwrap();
        assert_eq!(MailboxCounters::default(), index.get(&2u64).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let index = index();
        futures::future::join_all((0..25).map(|_| index.apply(&1u64, 1, 1)))
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .unwrap();
        assert_eq!(
            MailboxCounters {
                count: 25,
                unseen: 25
            },
            index.get(&1u64).await.unwrap()
        );
    }
}
