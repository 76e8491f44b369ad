//! Room origin enumeration seam
//!
//! Origin selection needs the set of distinct server names that have ever
//! sent state into a room. The evaluator derives that set from storage;
//! tests and tools can pin it statically.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tessera_core::{Result, RoomId, ServerName};

/// Provider of a room's candidate origin set.
#[async_trait]
pub trait RoomOrigins: Send + Sync {
    /// Distinct server names that have ever sent state into the room.
    async fn origins(&self, room_id: &RoomId) -> Result<Vec<ServerName>>;
}

/// Fixed origin sets, for tests and tools.
#[derive(Debug, Default)]
pub struct StaticRoomOrigins {
    rooms: RwLock<HashMap<RoomId, Vec<ServerName>>>,
}

impl StaticRoomOrigins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the origin set for a room.
    pub fn put(&self, room_id: RoomId, origins: Vec<ServerName>) {
        self.rooms.write().insert(room_id, origins);
    }
}

#[async_trait]
impl RoomOrigins for StaticRoomOrigins {
    async fn origins(&self, room_id: &RoomId) -> Result<Vec<ServerName>> {
        Ok(self.rooms.read().get(room_id).cloned().unwrap_or_default())
    }
}
