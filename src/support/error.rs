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

use std::io;

use thiserror::Error;

/// Which per-mailbox counter an allocation was attempting to advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sequence {
    Uid,
    Modseq,
}

#[derive(Error, Debug)]
pub enum Error {
    /// The CAS loop on a UID or MODSEQ counter row gave up.
    ///
    /// Nothing has been indexed for the operation that needed the number.
    #[error("Unable to allocate a new {0:?} after {1} attempts")]
    AllocationExhausted(Sequence, u32),
    /// A CAS loop other than sequence allocation gave up because other
    /// writers kept winning the race.
    #[error("Gave up on {0} after {1} attempts due to contention")]
    ContentionExhausted(&'static str, u32),
    /// Construction-time rejection of a configuration or parameter.
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Mailbox does not exist")]
    NxMailbox,
    #[error("Message does not exist")]
    NxMessage,
    #[error("Content {0} does not exist")]
    NxContent(String),
    #[error("Non-existent system flag")]
    NxFlag,
    #[error("Unsafe flag name")]
    UnsafeName,
    #[error("UID space of mailbox exhausted")]
    MailboxFull,
    #[error("Malformed row: {0}")]
    CorruptRow(&'static str),
    #[error("Malformed identifier")]
    BadIdentifier,
    /// An error reported by the key/value store itself.
    #[error("Storage failure: {0}")]
    Storage(String),
    #[error("Unable to initialise logging: {0}")]
    Logging(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
