//! Typed descriptors for the federation wire surface
//!
//! The evaluation core never builds HTTP by hand; it describes what it
//! wants and hands the descriptor to a `FederationClient`. Each variant
//! renders the method and path of the corresponding `/_matrix` endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_core::{EventId, KeyId, RoomId, ServerName, UserId};

/// The directory-style query endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Profile,
    Directory,
    UserDevices,
    ClientKeys,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Profile => "profile",
            QueryKind::Directory => "directory",
            QueryKind::UserDevices => "user_devices",
            QueryKind::ClientKeys => "client_keys",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request against a remote homeserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FederationRequest {
    /// Retrieve a single event by id.
    Event { event_id: EventId },

    /// Room state at a point in the DAG.
    State {
        room_id: RoomId,
        at_event: EventId,
        /// When set, only event ids are returned.
        ids_only: bool,
    },

    /// Walk history backwards from the given frontier.
    Backfill {
        room_id: RoomId,
        from: Vec<EventId>,
        limit: usize,
    },

    /// Request a join template for a user.
    MakeJoin { room_id: RoomId, user_id: UserId },

    /// Directory-style query.
    Query { kind: QueryKind },

    /// Peer version string.
    Version,

    /// A server's published signing key.
    ServerKeys { server: ServerName, key_id: KeyId },
}

impl FederationRequest {
    /// HTTP method for the endpoint.
    pub fn method(&self) -> &'static str {
        match self {
            FederationRequest::MakeJoin { .. } | FederationRequest::Query { .. } => "POST",
            _ => "GET",
        }
    }

    /// Path (with query string) for the endpoint.
    pub fn path(&self) -> String {
        match self {
            FederationRequest::Event { event_id } => {
                format!("/_matrix/federation/v1/event/{event_id}")
            }
            FederationRequest::State {
                room_id,
                at_event,
                ids_only,
            } => {
                let mut path =
                    format!("/_matrix/federation/v1/state/{room_id}?event_id={at_event}");
                if *ids_only {
                    path.push_str("&ids_only=true");
                }
                path
            }
            FederationRequest::Backfill {
                room_id,
                from,
                limit,
            } => {
                let frontier: Vec<&str> = from.iter().map(EventId::as_str).collect();
                format!(
                    "/_matrix/federation/v1/backfill/{room_id}?v={}&limit={limit}",
                    frontier.join(",")
                )
            }
            FederationRequest::MakeJoin { room_id, user_id } => {
                format!("/_matrix/federation/v1/make_join/{room_id}/{user_id}")
            }
            FederationRequest::Query { kind } => {
                format!("/_matrix/federation/v1/query/{kind}")
            }
            FederationRequest::Version => "/_matrix/federation/v1/version".to_string(),
            FederationRequest::ServerKeys { key_id, .. } => {
                format!("/_matrix/key/v2/server/{key_id}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_path() {
        let request = FederationRequest::Event {
            event_id: EventId::from("$abc"),
        };
        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/_matrix/federation/v1/event/$abc");
    }

    #[test]
    fn state_ids_only_flag() {
        let request = FederationRequest::State {
            room_id: RoomId::from("!r:x"),
            at_event: EventId::from("$e"),
            ids_only: true,
        };
        assert_eq!(
            request.path(),
            "/_matrix/federation/v1/state/!r:x?event_id=$e&ids_only=true"
        );
    }

    #[test]
    fn backfill_frontier_joined() {
        let request = FederationRequest::Backfill {
            room_id: RoomId::from("!r:x"),
            from: vec![EventId::from("$a"), EventId::from("$b")],
            limit: 20,
        };
        assert_eq!(
            request.path(),
            "/_matrix/federation/v1/backfill/!r:x?v=$a,$b&limit=20"
        );
    }

    #[test]
    fn make_join_is_post() {
        let request = FederationRequest::MakeJoin {
            room_id: RoomId::from("!r:x"),
            user_id: UserId::from("@u:x"),
        };
        assert_eq!(request.method(), "POST");
    }
}
