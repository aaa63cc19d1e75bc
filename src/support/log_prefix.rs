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

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included in at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    component: String,
    user: Option<String>,
    node: Option<String>,
}

impl LogPrefix {
    pub fn new(component: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                component,
                user: None,
                node: None,
            })),
        }
    }

    pub fn deep_clone(&self) -> Self {
        let inner = self.inner.lock().unwrap();
        Self {
            inner: Arc::new(Mutex::new(Inner::clone(&inner))),
        }
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(sanitise(user));
    }

    /// Record which storage node or cluster this process talks to.
    pub fn set_node(&self, node: String) {
        self.inner.lock().unwrap().node = Some(sanitise(node));
    }
}

impl Default for LogPrefix {
    fn default() -> Self {
        Self::new("kvmail".to_owned())
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.component)?;
        if inner.user.is_some() || inner.node.is_some() {
            write!(f, "[")?;
            let mut first = true;
            if let Some(ref user) = inner.user {
                write!(f, "{user}")?;
                first = false;
            }

            if let Some(ref node) = inner.node {
                if !mem::take(&mut first) {
                    write!(f, " ")?;
                }
                write!(f, "node={node}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formatting() {
        let prefix = LogPrefix::default();
        assert_eq!("kvmail", prefix.to_string());

        let copy = prefix.clone();
        copy.set_node("cass-1\n".to_owned());
        assert_eq!("kvmail[node=cass-1]", prefix.to_string());

        let detached = prefix.deep_clone();
        detached.set_user("zim".to_owned());
        assert_eq!("kvmail[zim node=cass-1]", detached.to_string());
        assert_eq!("kvmail[node=cass-1]", prefix.to_string());
    }
}
