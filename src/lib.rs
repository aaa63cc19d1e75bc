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

//! Placement of mail messages in mailboxes, and the per-mailbox aggregates
//! derived from them, on top of a key/value store offering nothing stronger
//! than single-row compare-and-swap.

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod flags;
pub mod index;
pub mod mapper;
pub mod model;
pub mod storage;
pub mod support;

pub use crate::flags::{Flag, Flags, FlagsUpdateCalculator, FlagsUpdateMode};
pub use crate::mapper::{MailboxMapper, MemoryMailboxMapper, MessageMapper};
pub use crate::storage::content::{ContentStore, KvContentStore};
pub use crate::storage::memory::MemoryStore;
pub use crate::storage::KvStore;
pub use crate::support::config::StoreConfig;
pub use crate::support::error::Error;
pub use crate::support::log_prefix::LogPrefix;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        // Another test harness may already have installed a logger
        let _ = support::logging::init_simple_log(log::LevelFilter::Debug);
    })
}
