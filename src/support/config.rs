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

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::Error;
use super::retry::{Backoff, RetryPolicy};

/// The configuration of one `MessageMapper`.
///
/// This is usually stored in a file named `kvmail.toml` next to whatever
/// configures the key/value store connection. Every field has a default, so
/// an empty file is a valid configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Retries for allocating UIDs and modseqs.
    ///
    /// Allocation is the hottest contention point (every writer to a mailbox
    /// goes through the same two rows), so this is much higher than the
    /// other limits.
    pub sequence: RetryConfig,
    /// Retries for the compare-and-swap of a single placement's flags.
    pub flags: RetryConfig,
    /// Retries for the counters and applicable-flags rows.
    pub aggregates: RetryConfig,
    pub content: ContentConfig,
    /// The maximum number of placements a bulk operation works on at once.
    pub concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            sequence: RetryConfig {
                max_retries: 100_000,
                backoff: Backoff::None,
            },
            flags: RetryConfig::default(),
            aggregates: RetryConfig::default(),
            content: ContentConfig::default(),
            concurrency: 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts. Must be positive.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 1000,
            backoff: Backoff::None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> Result<RetryPolicy, Error> {
        RetryPolicy::new(self.max_retries, self.backoff)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ContentConfig {
    /// The size of the rows message content is split into.
    pub chunk_size: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        ContentConfig {
            chunk_size: 64 * 1024,
        }
    }
}

impl StoreConfig {
    /// Load and validate the configuration in the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = fs::read(path)?;
        let config: StoreConfig = toml::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.sequence.policy()?;
        self.flags.policy()?;
        self.aggregates.policy()?;

        if 0 == self.content.chunk_size {
            return Err(Error::Validation(
                "content.chunk_size must be positive".to_owned(),
            ));
        }

        if 0 == self.concurrency {
            return Err(Error::Validation(
                "concurrency must be positive".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        StoreConfig::default().validate().unwrap();
        let parsed: StoreConfig = toml::from_str("").unwrap();
        assert_eq!(StoreConfig::default(), parsed);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
concurrency = 4

[sequence]
max_retries = 50
backoff = {{ kind = "exponential", delay_ms = 1, max_delay_ms = 64 }}

[flags.backoff]
kind = "fixed"
delay_ms = 5

[content]
chunk_size = 1024
"#
        )
        .unwrap();

        let config = StoreConfig::load(file.path()).unwrap();
        assert_eq!(4, config.concurrency);
        assert_eq!(50, config.sequence.max_retries);
        assert_eq!(
            Backoff::Exponential {
                delay_ms: 1,
                max_delay_ms: 64
            },
            config.sequence.backoff
        );
        assert_eq!(1000, config.flags.max_retries);
        assert_eq!(Backoff::Fixed { delay_ms: 5 }, config.flags.backoff);
        assert_eq!(RetryConfig::default(), config.aggregates);
        assert_eq!(1024, config.content.chunk_size);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = StoreConfig::default();
        config.flags.max_retries = 0;
        assert_matches!(Err(Error::Validation(_)), config.validate());

        let mut config = StoreConfig::default();
        config.content.chunk_size = 0;
        assert_matches!(Err(Error::Validation(_)), config.validate());

        let mut config = StoreConfig::default();
        config.concurrency = 0;
        assert_matches!(Err(Error::Validation(_)), config.validate());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[aggregates]\nmax_retries = 0").unwrap();
        assert_matches!(
            Err(Error::Validation(_)),
            StoreConfig::load(file.path())
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency = \"lots\"").unwrap();
        assert_matches!(Err(Error::Toml(_)), StoreConfig::load(file.path()));
    }
}
