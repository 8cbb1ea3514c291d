//! Authentication
//!
//! Username/password checking is a pluggable predicate; the broker only
//! asks "may this client connect". The in-tree implementation checks the
//! static user list loaded from the auth config file, with an
//! `allow_anonymous` escape hatch.

use ahash::AHashMap;

/// Pluggable CONNECT-time credential check
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> bool;
}

/// Static user-list authenticator
pub struct StaticAuth {
    allow_anonymous: bool,
    users: AHashMap<String, String>,
}

impl StaticAuth {
    pub fn new(allow_anonymous: bool, users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            allow_anonymous,
            users: users.into_iter().collect(),
        }
    }

    /// Accept everyone; used when no auth file is configured
    pub fn allow_all() -> Self {
        Self::new(true, [])
    }
}

impl Authenticator for StaticAuth {
    fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> bool {
        match username {
            None => self.allow_anonymous,
            Some(name) => match self.users.get(name) {
                Some(expected) => password == Some(expected.as_bytes()),
                None => self.allow_anonymous,
            },
        }
    }
}
