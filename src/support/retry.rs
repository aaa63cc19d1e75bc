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

//! Bounded retry of optimistic (compare-and-swap) operations.
//!
//! Every CAS loop in the crate goes through `RetryPolicy`, so the only thing a
//! call site decides is what counts as "lost the race, try again". Transport
//! errors are never in that category; they are handed straight back.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::Error;

/// The delay between two attempts of a retried operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Always wait the same amount of time.
    Fixed { delay_ms: u64 },
    /// Double the delay after every failed attempt, up to `max_delay_ms`.
    ///
    /// The actual delay is picked uniformly from the upper half of the
    /// nominal one so that writers which collided once do not collide again
    /// in lockstep.
    Exponential { delay_ms: u64, max_delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::None
    }
}

/// How many times, and how patiently, to retry an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Create a policy making at most `max_retries` attempts.
    ///
    /// Fails immediately if `max_retries` is 0.
    pub fn new(max_retries: u32, backoff: Backoff) -> Result<Self, Error> {
        if 0 == max_retries {
            return Err(Error::Validation(
                "max_retries must be positive".to_owned(),
            ));
        }

        if let Backoff::Exponential {
            delay_ms,
            max_delay_ms,
        } = backoff
        {
            if max_delay_ms < delay_ms {
                return Err(Error::Validation(format!(
                    "max_delay_ms ({max_delay_ms}) is less than \
                     delay_ms ({delay_ms})"
                )));
            }
        }

        Ok(RetryPolicy {
            max_retries,
            backoff,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `op` until `should_retry` accepts its result, for at most
    /// `max_retries` attempts.
    ///
    /// `op` is passed the zero-based attempt number. Returns `None` if every
    /// attempt was rejected.
    pub async fn run<T, F, Fut, P>(
        &self,
        mut op: F,
        should_retry: P,
    ) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        P: Fn(&T) -> bool,
    {
        for attempt in 0..self.max_retries {
            let result = op(attempt).await;
            if !should_retry(&result) {
                return Some(result);
            }

            if attempt + 1 < self.max_retries {
                if let Some(delay) = self.delay(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        None
    }

    /// Run a CAS-style operation, where `Ok(None)` means the write lost the
    /// race and `Ok(Some(_))` that it went through.
    ///
    /// Errors end the loop immediately. `Ok(None)` is returned if the
    /// attempts were exhausted; the caller decides which error that becomes.
    pub async fn run_cas<T, F, Fut>(&self, op: F) -> Result<Option<T>, Error>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, Error>>,
    {
        Ok(self
            .run(op, |r: &Result<Option<T>, Error>| matches!(*r, Ok(None)))
            .await
            .transpose()?
            .flatten())
    }

    fn delay(&self, attempt: u32) -> Option<Duration> {
        match self.backoff {
            Backoff::None => None,
            Backoff::Fixed { delay_ms } => {
                Some(Duration::from_millis(delay_ms))
            }
            Backoff::Exponential {
                delay_ms,
                max_delay_ms,
            } => {
                let nominal = delay_ms
                    .checked_shl(attempt.min(63))
                    .filter(|&d| d >= delay_ms)
                    .unwrap_or(max_delay_ms)
                    .min(max_delay_ms);
                Some(Duration::from_millis(jitter(nominal)))
            }
        }
    }
}

fn jitter(nominal_ms: u64) -> u64 {
    if nominal_ms < 2 {
        nominal_ms
    } else {
        rand::thread_rng().gen_range(nominal_ms / 2, nominal_ms + 1)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn zero_retries_rejected() {
        assert_matches!(
            Err(Error::Validation(_)),
            RetryPolicy::new(0, Backoff::None)
        );
        assert_matches!(
            Err(Error::Validation(_)),
            RetryPolicy::new(
                3,
                Backoff::Exponential {
                    delay_ms: 10,
                    max_delay_ms: 5,
                }
            )
        );
        assert!(RetryPolicy::new(1, Backoff::None).is_ok());
    }

    #[tokio::test]
    async fn run_cas_stops_on_success() {
        let policy = RetryPolicy::new(5, Backoff::None).unwrap();
        let calls = AtomicU32::new(0);
        let result = policy
            .run_cas(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(if attempt < 2 { None } else { Some(attempt) })
                }
            })
            .await
            .unwrap();
        assert_eq!(Some(2), result);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_cas_exhaustion_is_none() {
        let policy = RetryPolicy::new(4, Backoff::Fixed { delay_ms: 1 })
            .unwrap();
        let calls = AtomicU32::new(0);
        let result = policy
            .run_cas(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(None::<()>) }
            })
            .await
            .unwrap();
        assert_eq!(None, result);
        assert_eq!(4, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_cas_errors_are_not_retried() {
        let policy = RetryPolicy::new(10, Backoff::None).unwrap();
        let calls = AtomicU32::new(0);
        let result = policy
            .run_cas(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<Option<()>, _>(Error::Storage("down".into())) }
            })
            .await;
        assert_matches!(Err(Error::Storage(_)), result);
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = RetryPolicy::new(
            100,
            Backoff::Exponential {
                delay_ms: 4,
                max_delay_ms: 100,
            },
        )
        .unwrap();

        for attempt in 0..100 {
            let delay = policy.delay(attempt).unwrap();
            assert!(delay <= Duration::from_millis(100));
        }
        let first = policy.delay(0).unwrap();
        assert!(first >= Duration::from_millis(2));
        assert!(first <= Duration::from_millis(4));
        assert!(policy.delay(80).unwrap() >= Duration::from_millis(50));
    }
}
