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

//! An in-process `KvStore`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CasCondition, KvStore};
use crate::support::error::Error;

/// A `KvStore` backed by an ordered map.
///
/// Every operation first yields to the scheduler, so that tasks joined on
/// the same thread interleave at each storage call the way requests to a
/// remote store would.
///
/// Writes to chosen key prefixes can be made to fail, to exercise partial
/// failures.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    failing_prefixes: Mutex<Vec<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write to a key starting with `prefix` fail with
    /// `Error::Storage`.
    pub fn fail_writes_with_prefix(&self, prefix: Vec<u8>) {
        self.failing_prefixes.lock().unwrap().push(prefix);
    }

    pub fn clear_failures(&self) {
        self.failing_prefixes.lock().unwrap().clear();
    }

    /// Return the number of rows whose key starts with `prefix`.
    pub fn count_with_prefix(&self, prefix: &[u8]) -> usize {
        self.data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count()
    }

    fn check_writable(&self, key: &[u8]) -> Result<(), Error> {
        if self
            .failing_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|p| key.starts_with(p))
        {
            Err(Error::Storage(format!(
                "injected write failure for key {:02x?}",
                key
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        tokio::task::yield_now().await;
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), Error> {
        tokio::task::yield_now().await;
        self.check_writable(key)?;
        self.data.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), Error> {
        tokio::task::yield_now().await;
        self.check_writable(key)?;
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        condition: CasCondition<'_>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, Error> {
        tokio::task::yield_now().await;
        self.check_writable(key)?;

        let mut data = self.data.lock().unwrap();
        if !condition(data.get(key).map(|v| &v[..])) {
            return Ok(false);
        }

        match new {
            Some(value) => {
                data.insert(key.to_vec(), value);
            }
            None => {
                data.remove(key);
            }
        }
        Ok(true)
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        tokio::task::yield_now().await;
        if !end.is_empty() && start >= end {
            return Ok(vec![]);
        }

        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end)
        };

        let data = self.data.lock().unwrap();
        Ok(data
            .range::<[u8], _>((Bound::Included(start), upper))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
