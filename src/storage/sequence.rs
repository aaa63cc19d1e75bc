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

//! Allocation of per-mailbox UIDs and modseqs.
//!
//! Each mailbox has one counter row per sequence, holding the last value
//! handed out (absent means 0). Allocation reads the row and then
//! compare-and-swaps it to the next value; losing the race just means reading
//! again. Successive allocations within a mailbox are strictly increasing but
//! not necessarily dense.

use std::sync::Arc;

use log::{debug, warn};

use super::keys;
use super::rows::{decode, encode};
use super::KvStore;
use crate::model::{Identifier, Modseq, Uid};
use crate::support::error::{Error, Sequence};
use crate::support::log_prefix::LogPrefix;
use crate::support::retry::RetryPolicy;

#[derive(Clone)]
pub struct SequenceAllocator {
    store: Arc<dyn KvStore>,
    policy: RetryPolicy,
    log_prefix: LogPrefix,
}

impl SequenceAllocator {
    pub fn new(
        store: Arc<dyn KvStore>,
        policy: RetryPolicy,
        log_prefix: LogPrefix,
    ) -> Self {
        SequenceAllocator {
            store,
            policy,
            log_prefix,
        }
    }

    /// Return the last UID allocated in `mailbox`, if any.
    pub async fn last_uid(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<Option<Uid>, Error> {
        let raw = self.read(&keys::uid_sequence(mailbox)).await?;
        if raw > u64::from(u32::MAX) {
            return Err(Error::CorruptRow("UID counter out of range"));
        }

        Ok(Uid::of(raw as u32))
    }

    /// Return the highest modseq allocated in `mailbox`, if any.
    pub async fn highest_mod_seq(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<Option<Modseq>, Error> {
        Ok(Modseq::of(self.read(&keys::modseq_sequence(mailbox)).await?))
    }

    /// Allocate a UID, returning `None` if every attempt lost its race.
    pub async fn try_next_uid(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<Option<Uid>, Error> {
        let next = self
            .try_increment(
                &keys::uid_sequence(mailbox),
                u32::MAX.into(),
                Sequence::Uid,
                mailbox,
            )
            .await?;
        Ok(next.and_then(|raw| Uid::of(raw as u32)))
    }

    /// Allocate a modseq, returning `None` if every attempt lost its race.
    pub async fn try_next_mod_seq(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<Option<Modseq>, Error> {
        let next = self
            .try_increment(
                &keys::modseq_sequence(mailbox),
                u64::MAX,
                Sequence::Modseq,
                mailbox,
            )
            .await?;
        Ok(next.and_then(Modseq::of))
    }

    pub async fn next_uid(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<Uid, Error> {
        match self.try_next_uid(mailbox).await? {
            Some(uid) => Ok(uid),
            None => Err(self.exhausted(Sequence::Uid, mailbox)),
        }
    }

    pub async fn next_mod_seq(
        &self,
        mailbox: &impl Identifier,
    ) -> Result<Modseq, Error> {
        match self.try_next_mod_seq(mailbox).await? {
            Some(modseq) => Ok(modseq),
            None => Err(self.exhausted(Sequence::Modseq, mailbox)),
        }
    }

    fn exhausted(&self, seq: Sequence, mailbox: &impl Identifier) -> Error {
        warn!(
            "{} Gave up allocating {:?} in {} after {} attempts",
            self.log_prefix,
            seq,
            mailbox,
            self.policy.max_retries(),
        );
        Error::AllocationExhausted(seq, self.policy.max_retries())
    }

    async fn read(&self, key: &[u8]) -> Result<u64, Error> {
        stored_value(self.store.get(key).await?.as_deref())
    }

    async fn try_increment(
        &self,
        key: &[u8],
        limit: u64,
        seq: Sequence,
        mailbox: &impl Identifier,
    ) -> Result<Option<u64>, Error> {
        let this = self;
        this.policy
            .run_cas(move |attempt| async move {
                let current = this.read(key).await?;
                if current >= limit {
                    return Err(match seq {
                        Sequence::Uid => Error::MailboxFull,
                        Sequence::Modseq => {
                            Error::CorruptRow("modseq counter overflow")
                        }
                    });
                }

                let next = current + 1;
                let condition = move |stored: Option<&[u8]>| {
                    matches!(stored_value(stored), Ok(v) if v == current)
                };
                if this
                    .store
                    .compare_and_swap(key, &condition, Some(encode(&next)?))
                    .await?
                {
                    Ok(Some(next))
                } else {
                    debug!(
                        "{} {:?} allocation in {} lost race at {} \
                         (attempt {})",
                        this.log_prefix, seq, mailbox, current, attempt,
                    );
                    Ok(None)
                }
            })
            .await
    }
}

fn stored_value(stored: Option<&[u8]>) -> Result<u64, Error> {
    stored.map_or(Ok(0), decode)
}
