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

//! The message mapper: the operations the rest of a mail server performs on
//! the messages of mailboxes.
//!
//! This module tree should be thought of as one large module; the main type
//! is `MessageMapper`, whose implementation is split across multiple files
//! by area.

mod defs;
mod expunge;
mod fetch;
mod flags;
mod mailboxes;
mod messages;
mod status;

pub use defs::MessageMapper;
pub use mailboxes::{MailboxMapper, MemoryMailboxMapper};
