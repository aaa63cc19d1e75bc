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
use crate::flags::Flags;
use crate::model::Identifier;
use crate::storage::keys;
use crate::storage::rows::decode;
use crate::storage::KvStore;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::retry::RetryPolicy;

/// The union of every flag ever seen in each mailbox.
///
/// This only grows. Deleting the last message carrying a keyword leaves the
/// keyword applicable.
#[derive(Clone)]
pub struct ApplicableFlagsIndex {
    store: Arc<dyn KvStore>,
    policy: RetryPolicy,
    log_prefix: LogPrefix,
}

impl ApplicableFlagsIndex {
    pub fn new(
        store: Arc<dyn KvStore>,
        policy: RetryPolicy,
        log_prefix: LogPrefix,
    ) -> Self {
        ApplicableFlagsIndex {
            store,
            policy,
            log_prefix,
        }
    }

    pub async fn get(&self, mailbox: &impl Identifier) -> Result<Flags, Error> {
        match self.store.get(&keys::applicable_flags(mailbox)).await? {
            Some(raw) => decode(&raw),
            None => Ok(Flags::new()),
        }
    }

    /// Add `flags` to the applicable flags of `mailbox`.
    pub async fn union(
        &self,
        mailbox: &impl Identifier,
        flags: &Flags,
    ) -> Result<(), Error> {
        if flags.is_empty() {
            return Ok(());
        }

        update_row(
            &*self.store,
            &self.policy,
            &self.log_prefix,
            &keys::applicable_flags(mailbox),
            "applicable flags",
            |current: Option<Flags>| match current {
                Some(current) if current.is_superset(flags) => RowUpdate::Keep,
                Some(current) => RowUpdate::Set(current.union(flags)),
                None => RowUpdate::Set(flags.clone()),
            },
        )
        .await
    }

    pub async fn drop_mailbox(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<(), Error> {
        self.store.delete(&keys::applicable_flags(mailbox)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::support::retry::Backoff;

    fn index() -> ApplicableFlagsIndex {
        ApplicableFlagsIndex::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy::new(1000, Backoff::None).unwrap(),
            LogPrefix::default(),
        )
    }

    #[tokio::test]
    async fn union_only_grows() {
        let index = index();
        assert!(index.get(&1u64).await.unwrap().is_empty());

        index.union(&1u64, &Flags::f(&["\\Seen"])).await.unwrap();
        index
            .union(&1u64, &Flags::f(&["$Custom", "\\Seen"]))
            .await
            .unwrap();
        index.union(&1u64, &Flags::new()).await.unwrap();
        assert_eq!(
            Flags::f(&["\\Seen", "$Custom"]),
            index.get(&1u64).await.unwrap()
        );

        index.drop_mailbox(&1u64).await.unwrap();
        assert!(index.get(&1u64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_unions_merge() {
        let index = index();
        let a = Flags::f(&["a"]);
        let b = Flags::f(&["b"]);
        let c = Flags::f(&["c"]);
        let (ra, rb, rc) = futures::join!(
            index.union(&1u64, &a),
            index.union(&1u64, &b),
            index.union(&1u64, &c),
        );
        ra.unwrap();
        rb.unwrap();
        rc.unwrap();
        assert_eq!(
            Flags::f(&["a", "b", "c"]),
            index.get(&1u64).await.unwrap()
        );
    }
}
