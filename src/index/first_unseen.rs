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

use log::warn;

use super::{update_row, RowUpdate};
use crate::model::{Identifier, Uid};
use crate::storage::keys;
use crate::storage::rows::{decode, encode, PlacementRow};
use crate::storage::KvStore;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::retry::RetryPolicy;

/// How many placements to read at a time when looking for the next unseen
/// one.
const SCAN_PAGE: usize = 128;

/// The smallest UID of each mailbox without `\Seen`.
///
/// The pointer is only ever lowered by new unseen messages and only advanced
/// (by scanning forward) when the message it points at stops being unseen.
/// Absent means there is no unseen message.
#[derive(Clone)]
pub struct FirstUnseenIndex {
    store: Arc<dyn KvStore>,
    policy: RetryPolicy,
    log_prefix: LogPrefix,
}

impl FirstUnseenIndex {
    pub fn new(
        store: Arc<dyn KvStore>,
        policy: RetryPolicy,
        log_prefix: LogPrefix,
    ) -> Self {
        FirstUnseenIndex {
            store,
            policy,
            log_prefix,
        }
    }

    pub async fn get(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<Option<Uid>, Error> {
        self.store
            .get(&keys::first_unseen(mailbox))
            .await?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// Move the pointer down to `uid`, unless it already points at or below
    /// it.
    pub async fn lower_to(
        &self,
        mailbox: &impl Identifier,
        uid: Uid,
    ) -> Result<(), Error> {
        update_row(
            &*self.store,
            &self.policy,
            &self.log_prefix,
            &keys::first_unseen(mailbox),
            "first unseen pointer",
            |current: Option<Uid>| match current {
                Some(pointer) if pointer <= uid => RowUpdate::Keep,
                _ => RowUpdate::Set(uid),
            },
        )
        .await
    }

    /// If the pointer is at `uid`, which is no longer unseen, move it to the
    /// next unseen message after it, or remove it if there is none.
    ///
    /// The message the pointer lands on is checked again afterwards, since it
    /// may have become seen while the scan was running; in that case the
    /// pointer moves on again.
    pub async fn advance_past(
        &self,
        mailbox: &impl Identifier,
        mut uid: Uid,
    ) -> Result<(), Error> {
        while let Some(landed) = self.advance_once(mailbox, uid).await? {
            if Some(landed) == self.scan_first_unseen(mailbox, landed).await? {
                break;
            }

            uid = landed;
        }

        Ok(())
    }

    /// Returns the new value of the pointer if it was moved to another UID.
    async fn advance_once(
        &self,
        mailbox: &impl Identifier,
        uid: Uid,
    ) -> Result<Option<Uid>, Error> {
        let key = keys::first_unseen(mailbox);
        let key = &key[..];
        let this = self;

        let done = self
            .policy
            .run_cas(move |_| async move {
                let raw = this.store.get(key).await?;
                let current: Option<Uid> =
                    raw.as_deref().map(decode).transpose()?;
                if Some(uid) != current {
                    return Ok(Some(None));
                }

                let next = match uid.next() {
                    Some(after) => {
                        this.scan_first_unseen(mailbox, after).await?
                    }
                    None => None,
                };
                let new = next.as_ref().map(encode).transpose()?;

                let condition =
                    move |stored: Option<&[u8]>| stored == raw.as_deref();
                Ok(if this.store.compare_and_swap(key, &condition, new).await? {
                    Some(next)
                } else {
                    None
                })
            })
            .await?;

        match done {
            Some(landed) => Ok(landed),
            None => {
                warn!(
                    "{} Gave up advancing first unseen pointer of {} past {} \
                     after {} attempts",
                    self.log_prefix,
                    mailbox,
                    uid,
                    self.policy.max_retries(),
                );
                Err(Error::ContentionExhausted(
                    "first unseen pointer",
                    self.policy.max_retries(),
                ))
            }
        }
    }

    /// Find the first placement at or after `from` without `\Seen`.
    pub async fn scan_first_unseen(
        &self,
        mailbox: &impl Identifier,
        from: Uid,
    ) -> Result<Option<Uid>, Error> {
        let (mut start, end) =
            keys::uid_span(keys::BY_MAILBOX_UID, mailbox, from, Uid::MAX);

        loop {
            let page = self.store.scan(&start, &end, Some(SCAN_PAGE)).await?;
            let page_len = page.len();
            let mut last_uid = None;
            for (_, raw) in page {
                let row: PlacementRow = decode(&raw)?;
                if !row.flags.is_seen() {
                    return Ok(Some(row.uid));
                }
                last_uid = Some(row.uid);
            }

            match last_uid.and_then(Uid::next) {
                Some(next) if SCAN_PAGE == page_len => {
                    start = keys::by_mailbox_uid(mailbox, next);
                }
                _ => return Ok(None),
            }
        }
    }

    pub async fn drop_mailbox(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<(), Error> {
        self.store.delete(&keys::first_unseen(mailbox)).await
    }
}
