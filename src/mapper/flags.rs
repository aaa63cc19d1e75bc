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

use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};

use super::defs::MessageMapper;
use crate::flags::FlagsUpdateCalculator;
use crate::model::*;
use crate::support::error::Error;

impl<S: IdScheme> MessageMapper<S> {
    /// Apply `calculator` to every placement of `mailbox` within `range`.
    ///
    /// Each placement is updated independently with its own retries; up to
    /// the configured concurrency are in flight at once. Placements that were
    /// deleted while being updated are silently left out of the result, as
    /// are those of a mailbox deleted in the meantime. Placements the
    /// calculator did not change are included with their current modseq.
    ///
    /// A placement whose update fails is logged and listed in the report's
    /// `failed`; the other placements are still updated and reported. The
    /// only error returned directly is failure to list the range.
    pub async fn update_flags(
        &self,
        mailbox: &Mailbox<S>,
        calculator: &FlagsUpdateCalculator,
        range: UidRange,
    ) -> Result<FlagsUpdateReport, Error> {
        let placements =
            self.placements.list_range(&mailbox.id, range, None).await?;
        let outcomes = stream::iter(placements)
            .map(|state| {
                let uid = state.uid();
                async move {
                    (uid, self.update_one(mailbox, calculator, state).await)
                }
            })
            .buffered(self.config.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut report = FlagsUpdateReport::default();
        for (uid, outcome) in outcomes {
            match outcome {
                Ok(outcome) => {
                    report.updated.extend(outcome.into_updated_flags())
                }
                Err(e) => {
                    error!(
                        "{} Flag update {:?} {} of {}/{} failed: {}",
                        self.log_prefix,
                        calculator.mode(),
                        calculator.flags(),
                        mailbox.name,
                        uid,
                        e
                    );
                    report.failed.push((uid, e));
                }
            }
        }

        Ok(report)
    }

    /// Apply `calculator` to the single placement `observed`.
    ///
    /// The first attempt works from `observed` as given, even if it is
    /// already out of date; every retry reads the placement again.
    pub async fn update_one(
        &self,
        mailbox: &Mailbox<S>,
        calculator: &FlagsUpdateCalculator,
        observed: ComposedMessageIdWithMetaData<S>,
    ) -> Result<FlagsUpdateOutcome, Error> {
        let uid = observed.uid();
        // A modseq allocated by an earlier attempt whose compare-and-swap
        // failed. 0 if none.
        let reserved = AtomicU64::new(0);

        let this = self;
        let observed = &observed;
        let reserved = &reserved;
        let outcome = self
            .flags_policy
            .run_cas(move |attempt| async move {
                let current = if 0 == attempt {
                    observed.clone()
                } else {
                    match this.placements.retrieve(&observed.composed).await? {
                        Some(current) => current,
                        None => {
                            return this.skipped(mailbox, uid).await.map(Some)
                        }
                    }
                };

                let new_flags = calculator.apply(&current.flags);
                if new_flags == current.flags {
                    return Ok(Some(FlagsUpdateOutcome::Unchanged(
                        UpdatedFlags {
                            uid,
                            mod_seq: current.mod_seq,
                            old_flags: current.flags.clone(),
                            new_flags,
                        },
                    )));
                }

                let mod_seq =
                    this.reserve_mod_seq(&mailbox.id, reserved).await?;
                let new_state = ComposedMessageIdWithMetaData {
                    composed: current.composed.clone(),
                    flags: new_flags,
                    mod_seq,
                };

                if !this
                    .placements
                    .cas_update_flags(&new_state, current.mod_seq)
                    .await?
                {
                    debug!(
                        "{} Flags of {}/{} changed under us at {:?} \
                         (attempt {})",
                        this.log_prefix,
                        mailbox.name,
                        uid,
                        current.mod_seq,
                        attempt,
                    );
                    return Ok(None);
                }

                this.indexes
                    .on_flags_update(
                        &mailbox.id,
                        uid,
                        &current.flags,
                        &new_state.flags,
                    )
                    .await?;

                Ok(Some(FlagsUpdateOutcome::Updated(UpdatedFlags {
                    uid,
                    mod_seq,
                    old_flags: current.flags,
                    new_flags: new_state.flags,
                })))
            })
            .await?;

        match outcome {
            Some(outcome) => Ok(outcome),
            None => {
                warn!(
                    "{} Gave up updating flags of {}/{} after {} attempts",
                    self.log_prefix,
                    mailbox.name,
                    uid,
                    self.flags_policy.max_retries(),
                );
                Err(Error::ContentionExhausted(
                    "flags update",
                    self.flags_policy.max_retries(),
                ))
            }
        }
    }

    /// Return the modseq to write a flag change with.
    ///
    /// A modseq reserved by an earlier failed attempt is used again if it is
    /// still the highest of the mailbox: nothing has been written with it
    /// and nothing newer exists, so it still orders after every placement.
    /// Otherwise a new one is allocated.
    async fn reserve_mod_seq(
        &self,
        mailbox: &S::MailboxId,
        reserved: &AtomicU64,
    ) -> Result<Modseq, Error> {
        if let Some(previous) = Modseq::of(reserved.load(Ordering::SeqCst)) {
            if Some(previous) == self.sequences.highest_mod_seq(mailbox).await?
            {
                return Ok(previous);
            }
        }

        let mod_seq = self.sequences.next_mod_seq(mailbox).await?;
        reserved.store(mod_seq.raw(), Ordering::SeqCst);
        Ok(mod_seq)
    }

    /// Work out why the placement at `uid` disappeared.
    async fn skipped(
        &self,
        mailbox: &Mailbox<S>,
        uid: Uid,
    ) -> Result<FlagsUpdateOutcome, Error> {
        let reason = match self.mailboxes.find_mailbox_by_id(&mailbox.id).await
        {
            Ok(_) => SkipReason::Deleted,
            Err(Error::NxMailbox) => SkipReason::MailboxDeleted,
            Err(e) => return Err(e),
        };

        info!(
            "{} Dropping flag update of {}/{}: {:?}",
            self.log_prefix, mailbox.name, uid, reason
        );
        Ok(FlagsUpdateOutcome::Skipped(uid, reason))
    }
}
