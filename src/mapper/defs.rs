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

use super::mailboxes::MailboxMapper;
use crate::index::IndexTableHandler;
use crate::model::IdScheme;
use crate::storage::content::{ContentStore, KvContentStore};
use crate::storage::messages::MessageStore;
use crate::storage::placement::PlacementStore;
use crate::storage::sequence::SequenceAllocator;
use crate::storage::KvStore;
use crate::support::config::StoreConfig;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::retry::RetryPolicy;

/// Stores the messages of mailboxes on a `KvStore`.
///
/// A `MessageMapper` holds no state of its own beyond its handles, so any
/// number of them, on any number of hosts, may work on the same mailboxes at
/// once.
pub struct MessageMapper<S: IdScheme> {
    pub(super) config: StoreConfig,
    pub(super) content: Arc<dyn ContentStore>,
    pub(super) mailboxes: Arc<dyn MailboxMapper<S>>,
    pub(super) sequences: SequenceAllocator,
    pub(super) placements: PlacementStore<S>,
    pub(super) messages: MessageStore<S>,
    pub(super) indexes: IndexTableHandler,
    /// The policy for compare-and-swap of placement flags.
    pub(super) flags_policy: RetryPolicy,
    pub(super) log_prefix: LogPrefix,
}

impl<S: IdScheme> MessageMapper<S> {
    /// Set up a mapper storing content in `content`.
    ///
    /// Fails with `Error::Validation` if `config` is invalid.
    pub fn new(
        config: StoreConfig,
        store: Arc<dyn KvStore>,
        content: Arc<dyn ContentStore>,
        mailboxes: Arc<dyn MailboxMapper<S>>,
        log_prefix: LogPrefix,
    ) -> Result<Self, Error> {
        config.validate()?;

        Ok(MessageMapper {
            sequences: SequenceAllocator::new(
                Arc::clone(&store),
                config.sequence.policy()?,
                log_prefix.clone(),
            ),
            placements: PlacementStore::new(
                Arc::clone(&store),
                log_prefix.clone(),
            ),
            messages: MessageStore::new(Arc::clone(&store)),
            indexes: IndexTableHandler::new(
                store,
                config.aggregates.policy()?,
                log_prefix.clone(),
            ),
            flags_policy: config.flags.policy()?,
            content,
            mailboxes,
            config,
            log_prefix,
        })
    }

    /// Set up a mapper keeping content in the same `KvStore` as everything
    /// else.
    pub fn with_kv_content(
        config: StoreConfig,
        store: Arc<dyn KvStore>,
        mailboxes: Arc<dyn MailboxMapper<S>>,
        log_prefix: LogPrefix,
    ) -> Result<Self, Error> {
        let content = Arc::new(KvContentStore::new(
            Arc::clone(&store),
            config.content.chunk_size,
        ));
        Self::new(config, store, content, mailboxes, log_prefix)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[cfg(test)]
pub(super) struct TestFixture {
    pub(super) kv: Arc<crate::storage::memory::MemoryStore>,
    pub(super) mailboxes:
        Arc<super::mailboxes::MemoryMailboxMapper<crate::model::NumericIds>>,
    pub(super) mapper: MessageMapper<crate::model::NumericIds>,
    pub(super) inbox: crate::model::Mailbox<crate::model::NumericIds>,
    pub(super) archive: crate::model::Mailbox<crate::model::NumericIds>,
}

#[cfg(test)]
impl TestFixture {
    pub(super) fn new() -> Self {
        use crate::support::retry::Backoff;

        let mut config = StoreConfig::default();
        config.flags.max_retries = 100_000;
        config.aggregates.max_retries = 100_000;
        config.sequence.backoff = Backoff::None;
        // Small enough that most test messages span several chunks
        config.content.chunk_size = 16;
        Self::with_config(config)
    }

    pub(super) fn with_config(config: StoreConfig) -> Self {
        use super::mailboxes::MemoryMailboxMapper;
        use crate::model::{Mailbox, NumericIds};
        use crate::storage::memory::MemoryStore;

        crate::init_test_log();

        let kv = Arc::new(MemoryStore::new());
        let mailboxes = Arc::new(MemoryMailboxMapper::<NumericIds>::new());
        let inbox = Mailbox::<NumericIds> {
            id: 1,
            namespace: "#private".to_owned(),
            user: "zim".to_owned(),
            name: "INBOX".to_owned(),
            uid_validity: 1,
        };
        let archive = Mailbox {
            id: 2,
            name: "Archive".to_owned(),
            ..inbox.clone()
        };
        mailboxes.insert(inbox.clone());
        mailboxes.insert(archive.clone());

        let mapper = MessageMapper::with_kv_content(
            config,
            kv.clone(),
            mailboxes.clone(),
            LogPrefix::default(),
        )
        .unwrap();

        Self {
            kv,
            mailboxes,
            mapper,
            inbox,
            archive,
        }
    }

    pub(super) fn draft(
        &self,
        message_id: u64,
        flags: &[&str],
    ) -> crate::model::MessageDraft<crate::model::NumericIds> {
        use chrono::prelude::*;

        crate::model::MessageDraft {
            message_id,
            internal_date: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2020, 6, 1, 12, 0, 0)
                .unwrap(),
            header: format!("Message-ID: <{}@example.com>\r\n\r\n", message_id)
                .into_bytes(),
            body: format!("This is the body of message {}.\r\n", message_id)
                .into_bytes(),
            flags: crate::flags::Flags::f(flags),
            attachments: vec![],
        }
    }

    /// Add message `message_id` to `mailbox` with the given flags.
    pub(super) async fn add(
        &self,
        mailbox: &crate::model::Mailbox<crate::model::NumericIds>,
        message_id: u64,
        flags: &[&str],
    ) -> crate::model::MessageMetaData<crate::model::NumericIds> {
        self.mapper
            .add(mailbox, self.draft(message_id, flags))
            .await
            .unwrap()
    }
}
