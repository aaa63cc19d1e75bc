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

use log::info;

use super::defs::MessageMapper;
use crate::flags::Flags;
use crate::model::*;
use crate::support::error::Error;

impl<S: IdScheme> MessageMapper<S> {
    /// Return the cached message counts of `mailbox`, all zero if nothing
    /// has been stored.
    pub async fn get_mailbox_counters(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<MailboxCounters, Error> {
        self.indexes.counters.get(&mailbox.id).await
    }

    pub async fn count_messages(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<u64, Error> {
        Ok(self.get_mailbox_counters(mailbox).await?.count)
    }

    pub async fn count_unseen_messages(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<u64, Error> {
        Ok(self.get_mailbox_counters(mailbox).await?.unseen)
    }

    /// Return every flag ever set on a placement of `mailbox`.
    ///
    /// The set only grows, so it may name flags no current message carries.
    pub async fn get_applicable_flags(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<Flags, Error> {
        self.indexes.applicable_flags.get(&mailbox.id).await
    }

    pub async fn find_recent_uids(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<Vec<Uid>, Error> {
        self.indexes.recent.list(&mailbox.id).await
    }

    /// Return the lowest UID in `mailbox` without `\Seen`, if there is one.
    pub async fn find_first_unseen_uid(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<Option<Uid>, Error> {
        self.indexes.first_unseen.get(&mailbox.id).await
    }

    /// Return the last UID allocated in `mailbox`.
    ///
    /// The placement it was allocated for may since have been deleted, or
    /// never have been written.
    pub async fn last_uid(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<Option<Uid>, Error> {
        self.sequences.last_uid(&mailbox.id).await
    }

    pub async fn highest_mod_seq(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<Option<Modseq>, Error> {
        self.sequences.highest_mod_seq(&mailbox.id).await
    }

    /// Drop the aggregate rows of `mailbox`, which its owner is destroying.
    ///
    /// Placements, message rows and sequence counters are left alone.
    pub async fn delete_mailbox_indexes(
        &self,
        mailbox: &Mailbox<S>,
    ) -> Result<(), Error> {
        self.indexes.drop_mailbox(&mailbox.id).await?;
        info!(
            "{} Dropped aggregate rows of {}",
            self.log_prefix, mailbox.name
        );
        Ok(())
    }
}
