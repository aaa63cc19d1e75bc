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

use futures::future;

use crate::model::{Identifier, Uid};
use crate::storage::keys::{self, KeyBuilder};
use crate::storage::KvStore;
use crate::support::error::Error;

/// The set of UIDs in each mailbox carrying `\Recent`.
///
/// Each member is its own empty row, so adding and removing members never
/// contend with each other.
#[derive(Clone)]
pub struct RecentIndex {
    store: Arc<dyn KvStore>,
}

impl RecentIndex {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        RecentIndex { store }
    }

    pub async fn add(
        &self,
        mailbox: &impl Identifier,
        uid: Uid,
    ) -> Result<(), Error> {
        self.store.put(&keys::recent(mailbox, uid), Vec::new()).await
    }

    pub async fn remove(
        &self,
        mailbox: &impl Identifier,
        uid: Uid,
    ) -> Result<(), Error> {
        self.store.delete(&keys::recent(mailbox, uid)).await
    }

    /// List the recent UIDs of `mailbox` in ascending order.
    pub async fn list(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<Vec<Uid>, Error> {
        let prefix = KeyBuilder::new(keys::RECENT).id(mailbox).build();
        self.store
            .scan(&prefix, &keys::prefix_end(&prefix), None)
            .await?
            .into_iter()
            .map(|(key, _)| keys::trailing_uid(&key))
            .collect()
    }

    pub async fn drop_mailbox(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<(), Error> {
        let uids = self.list(mailbox).await?;
        future::try_join_all(
            uids.into_iter().map(|uid| self.remove(mailbox, uid)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn membership() {
        let index = RecentIndex::new(Arc::new(MemoryStore::new()));
        index.add(&1u64, Uid::u(9)).await.unwrap();
        index.add(&1u64, Uid::u(3)).await.unwrap();
        index.add(&1u64, Uid::u(3)).await.unwrap();
        index.add(&2u64, Uid::u(1)).await.unwrap();
        assert_eq!(
            vec![Uid::u(3), Uid::u(9)],
            index.list(&1u64).await.unwrap()
        );

        index.remove(&1u64, Uid::u(3)).await.unwrap();
        index.remove(&1u64, Uid::u(4)).await.unwrap();
        assert_eq!(vec![Uid::u(9)], index.list(&1u64).await.unwrap());

        index.drop_mailbox(&1u64).await.unwrap();
        assert!(index.list(&1u64).await.unwrap().is_empty());
        assert_eq!(vec![Uid::u(1)], index.list(&2u64).await.unwrap());
    }
}
