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

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{IdScheme, Mailbox};
use crate::support::error::Error;

/// Resolves mailboxes by id.
///
/// The message mapper only uses this to tell whether a mailbox still exists.
/// Mailbox names, hierarchy and ACLs are the business of whatever implements
/// it.
#[async_trait]
pub trait MailboxMapper<S: IdScheme>: Send + Sync {
    /// Look up the mailbox with the given id, failing with
    /// `Error::NxMailbox` if there is none.
    async fn find_mailbox_by_id(
        &self,
        id: &S::MailboxId,
    ) -> Result<Mailbox<S>, Error>;
}

/// A `MailboxMapper` over an in-process map.
pub struct MemoryMailboxMapper<S: IdScheme> {
    mailboxes: Mutex<HashMap<S::MailboxId, Mailbox<S>>>,
}

impl<S: IdScheme> Default for MemoryMailboxMapper<S> {
    fn default() -> Self {
        MemoryMailboxMapper {
            mailboxes: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: IdScheme> MemoryMailboxMapper<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mailbox: Mailbox<S>) {
        self.mailboxes
            .lock()
            .unwrap()
            .insert(mailbox.id.clone(), mailbox);
    }

    pub fn remove(&self, id: &S::MailboxId) -> Option<Mailbox<S>> {
        self.mailboxes.lock().unwrap().remove(id)
    }
}

#[async_trait]
impl<S: IdScheme> MailboxMapper<S> for MemoryMailboxMapper<S> {
    async fn find_mailbox_by_id(
        &self,
        id: &S::MailboxId,
    ) -> Result<Mailbox<S>, Error> {
        self.mailboxes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NxMailbox)
    }
}
