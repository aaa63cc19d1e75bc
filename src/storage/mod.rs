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

//! The storage layer.
//!
//! Everything here is stateless apart from the `KvStore` handle it is given,
//! and provides the building blocks used by the index and mapper layers. The
//! general guidelines are:
//!
//! 1. Only single-row operations are atomic. There is no transaction and no
//!    ordering between writes to different rows.
//! 2. The only conditional write is `compare_and_swap`, and every CAS loop
//!    goes through `RetryPolicy`.
//! 3. Keys are built with `keys::KeyBuilder` so that scan order is UID order.
//! 4. Row values are CBOR, through `rows::encode` and `rows::decode`.

use async_trait::async_trait;

use crate::support::error::Error;

pub mod content;
pub mod keys;
pub mod memory;
pub mod messages;
pub mod placement;
pub mod rows;
pub mod sequence;

/// The condition of a `compare_and_swap`.
///
/// It is passed the current value of the row, or `None` if the row does not
/// exist, and returns whether the write should happen.
pub type CasCondition<'a> = &'a (dyn Fn(Option<&[u8]>) -> bool + Send + Sync);

/// A distributed, eventually-consistent key/value store with single-row
/// compare-and-swap.
///
/// Keys are ordered bytewise. Implementations must make `compare_and_swap`
/// linearisable per row; nothing else is expected to be.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), Error>;

    /// Remove `key`. Removing a row which does not exist is not an error.
    async fn delete(&self, key: &[u8]) -> Result<(), Error>;

    /// Atomically replace the row at `key` with `new` (`None` deletes it) if
    /// `condition` accepts the current value.
    ///
    /// Returns whether the write happened. Losing the race is not an error.
    async fn compare_and_swap(
        &self,
        key: &[u8],
        condition: CasCondition<'_>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, Error>;

    /// Return the rows with keys in `start..end` in ascending key order, at
    /// most `limit` of them.
    ///
    /// An empty `end` means the scan is unbounded above.
    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error>;
}
