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

//! Message flags and the pure calculation of flag changes.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::support::error::Error;

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in the
/// `Keyword` case.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags.
///
/// Unlike a protocol layer, the store does keep `\Recent` as a real flag,
/// since it is persisted with the placement and drives the recent set.
#[derive(Clone)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Recent,
    Seen,
    Keyword(String),
}

impl Flag {
    fn rank(&self) -> u8 {
        match *self {
            Flag::Answered => 0,
            Flag::Deleted => 1,
            Flag::Draft => 2,
            Flag::Flagged => 3,
            Flag::Recent => 4,
            Flag::Seen => 5,
            Flag::Keyword(_) => 6,
        }
    }

    /// Create a keyword flag, validating that it is a legal atom.
    pub fn keyword(kw: &str) -> Result<Self, Error> {
        match kw.parse()? {
            Flag::Keyword(kw) => Ok(Flag::Keyword(kw)),
            _ => Err(Error::UnsafeName),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Flag::Answered => write!(f, "\\Answered"),
            &Flag::Deleted => write!(f, "\\Deleted"),
            &Flag::Draft => write!(f, "\\Draft"),
            &Flag::Flagged => write!(f, "\\Flagged"),
            &Flag::Recent => write!(f, "\\Recent"),
            &Flag::Seen => write!(f, "\\Seen"),
            &Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\recent") {
            Ok(Flag::Recent)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

// Keywords compare ASCII-case-insensitively. Ord and Hash must agree with
// that so that a `Flags` set never holds two spellings of one keyword.
impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        Ordering::Equal == self.cmp(other)
    }
}

impl Eq for Flag {}

impl PartialOrd for Flag {
    fn partial_cmp(&self, other: &Flag) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Flag {
    fn cmp(&self, other: &Flag) -> Ordering {
        match (self, other) {
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => a
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Flag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        if let Flag::Keyword(ref kw) = *self {
            for c in kw.bytes() {
                c.to_ascii_lowercase().hash(state);
            }
        }
    }
}

impl Serialize for Flag {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A set of flags, as carried by one placement or accumulated by a mailbox.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(BTreeSet<Flag>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        self.0.contains(flag)
    }

    /// Returns true if the flag was not already present.
    pub fn insert(&mut self, flag: Flag) -> bool {
        self.0.insert(flag)
    }

    /// Returns true if the flag was present.
    pub fn remove(&mut self, flag: &Flag) -> bool {
        self.0.remove(flag)
    }

    pub fn is_seen(&self) -> bool {
        self.contains(&Flag::Seen)
    }

    pub fn is_recent(&self) -> bool {
        self.contains(&Flag::Recent)
    }

    pub fn is_deleted(&self) -> bool {
        self.contains(&Flag::Deleted)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> + '_ {
        self.0.iter()
    }

    pub fn union(&self, other: &Flags) -> Flags {
        Flags(self.0.union(&other.0).cloned().collect())
    }

    pub fn difference(&self, other: &Flags) -> Flags {
        Flags(self.0.difference(&other.0).cloned().collect())
    }

    /// Return whether every flag in `other` is also in `self`.
    pub fn is_superset(&self, other: &Flags) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Copy of these flags with `flag` inserted.
    pub fn with(mut self, flag: Flag) -> Self {
        self.0.insert(flag);
        self
    }

    #[cfg(test)]
    pub fn f(names: &[&str]) -> Self {
        names.iter().map(|n| n.parse::<Flag>().unwrap()).collect()
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<I: IntoIterator<Item = Flag>>(it: I) -> Self {
        Flags(it.into_iter().collect())
    }
}

impl IntoIterator for Flags {
    type Item = Flag;
    type IntoIter = std::collections::btree_set::IntoIter<Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Flags {
    type Item = &'a Flag;
    type IntoIter = std::collections::btree_set::Iter<'a, Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (ix, flag) in self.0.iter().enumerate() {
            if 0 != ix {
                write!(f, " ")?;
            }
            write!(f, "{}", flag)?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Flags{}", self)
    }
}

/// How a `FlagsUpdateCalculator` combines its flags with the current ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagsUpdateMode {
    /// Union; `+FLAGS`.
    Add,
    /// Difference; `-FLAGS`.
    Remove,
    /// Wholesale substitution; `FLAGS`.
    Replace,
}

/// A requested change to the flags of a set of placements.
///
/// `apply` is pure, so the same calculator is reapplied to freshly read state
/// on every retry of a contended update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagsUpdateCalculator {
    mode: FlagsUpdateMode,
    flags: Flags,
}

impl FlagsUpdateCalculator {
    pub fn new(mode: FlagsUpdateMode, flags: Flags) -> Self {
        FlagsUpdateCalculator { mode, flags }
    }

    pub fn add(flags: Flags) -> Self {
        Self::new(FlagsUpdateMode::Add, flags)
    }

    pub fn remove(flags: Flags) -> Self {
        Self::new(FlagsUpdateMode::Remove, flags)
    }

    pub fn replace(flags: Flags) -> Self {
        Self::new(FlagsUpdateMode::Replace, flags)
    }

    pub fn mode(&self) -> FlagsUpdateMode {
        self.mode
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Compute the flags resulting from applying this change to `old`.
    ///
    /// `\Recent` and `\Deleted` are session-local rather than client-settable
    /// through a replacement, so `Replace` carries them over from `old`.
    pub fn apply(&self, old: &Flags) -> Flags {
        match self.mode {
            FlagsUpdateMode::Add => old.union(&self.flags),
            FlagsUpdateMode::Remove => old.difference(&self.flags),
            FlagsUpdateMode::Replace => {
                let mut new = self.flags.clone();
                for sticky in &[Flag::Recent, Flag::Deleted] {
                    if old.contains(sticky) {
                        new.insert(sticky.clone());
                    }
                }
                new
            }
        }
    }
}
