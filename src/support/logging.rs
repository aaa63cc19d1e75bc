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

//! Process-level logger installation.
//!
//! The library itself only ever talks to the `log` facade. Embedding programs
//! either call one of these functions or install a logger of their own.

use std::path::Path;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use super::error::Error;

const STDERR_PATTERN: &str = "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}";

/// Log everything at `level` and above to stderr.
pub fn init_simple_log(level: LevelFilter) -> Result<(), Error> {
    log4rs::init_config(stderr_config(level)?)
        .map(|_| ())
        .map_err(|e| Error::Logging(e.to_string()))
}

/// Configure logging from a log4rs TOML file.
pub fn init_log_file(path: impl AsRef<Path>) -> Result<(), Error> {
    log4rs::init_file(path, log4rs::file::Deserializers::default())
        .map_err(|e| Error::Logging(e.to_string()))
}

fn stderr_config(level: LevelFilter) -> Result<Config, Error> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(STDERR_PATTERN)))
        .build();

    Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|e| Error::Logging(e.to_string()))
}
