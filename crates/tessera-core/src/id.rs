//! Matrix identifier types
//!
//! Sigil-prefixed string newtypes: `$` event ids, `!` room ids, `@` user
//! ids, bare server names, and `algorithm:version` signing key ids.
//! Construction never fails; validity is a separate predicate so that the
//! conformance report can describe malformed events instead of refusing to
//! parse them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest server name accepted in an `origin` field.
pub const ORIGIN_MAX_SIZE: usize = 256;

macro_rules! string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the inner string
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the identifier is the empty string
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id! {
    /// An event id: `$` followed by the URL-safe unpadded base64 of the
    /// event's reference hash.
    EventId
}

string_id! {
    /// A room id of the form `!opaque:server.name`.
    RoomId
}

string_id! {
    /// A user id of the form `@localpart:server.name`.
    UserId
}

string_id! {
    /// A bare homeserver name, possibly with an explicit port.
    ServerName
}

string_id! {
    /// A signing key id of the form `ed25519:version`.
    KeyId
}

impl EventId {
    /// Valid v4 event ids are `$` plus 43 URL-safe base64 characters.
    pub fn is_valid(&self) -> bool {
        let Some(rest) = self.0.strip_prefix('$') else {
            return false;
        };
        rest.len() == 43
            && rest
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

impl RoomId {
    /// Room ids carry the `!` sigil and a `:server` part.
    pub fn is_valid(&self) -> bool {
        sigil_with_host(&self.0, '!')
    }

    /// The server part after the first `:`, when present.
    pub fn host(&self) -> Option<&str> {
        host_part(&self.0)
    }
}

impl UserId {
    /// User ids carry the `@` sigil and a `:server` part.
    pub fn is_valid(&self) -> bool {
        sigil_with_host(&self.0, '@')
    }

    /// The server part after the first `:`, when present.
    pub fn host(&self) -> Option<&str> {
        host_part(&self.0)
    }
}

impl ServerName {
    /// Server names are bounded, non-empty hostname[:port] strings.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= ORIGIN_MAX_SIZE
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':' | b'[' | b']'))
    }
}

impl KeyId {
    /// Key ids take the form `algorithm:version`.
    pub fn is_valid(&self) -> bool {
        matches!(self.0.split_once(':'), Some((alg, ver)) if !alg.is_empty() && !ver.is_empty())
    }

    /// The algorithm part before the `:`.
    pub fn algorithm(&self) -> Option<&str> {
        self.0.split_once(':').map(|(alg, _)| alg)
    }
}

fn sigil_with_host(id: &str, sigil: char) -> bool {
    let Some(rest) = id.strip_prefix(sigil) else {
        return false;
    };
    match rest.split_once(':') {
        Some((local, host)) => !local.is_empty() && !host.is_empty(),
        None => false,
    }
}

fn host_part(id: &str) -> Option<&str> {
    id.split_once(':').map(|(_, host)| host).filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_host_extraction() {
        let user = UserId::from("@alice:example.org");
        assert!(user.is_valid());
        assert_eq!(user.host(), Some("example.org"));

        assert!(!UserId::from("alice:example.org").is_valid());
        assert!(!UserId::from("@:example.org").is_valid());
        assert!(!UserId::from("@alice").is_valid());
    }

    #[test]
    fn event_id_v4_shape() {
        let id = EventId::from("$abcdefghijklmnopqrstuvwxyzABCDEFGHIJKL-_0");
        assert!(id.is_valid());
        assert!(!EventId::from("$short").is_valid());
        assert!(!EventId::from("!notanevent:x").is_valid());
    }

    #[test]
    fn server_name_charset() {
        assert!(ServerName::from("matrix.example.org:8448").is_valid());
        assert!(!ServerName::from("").is_valid());
        assert!(!ServerName::from("bad server").is_valid());
    }

    #[test]
    fn key_id_split() {
        let key = KeyId::from("ed25519:auto");
        assert!(key.is_valid());
        assert_eq!(key.algorithm(), Some("ed25519"));
        assert!(!KeyId::from("ed25519").is_valid());
    }
}
