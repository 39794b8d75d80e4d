use super::ConnectionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names one client-side fetch of an entity: the owning connection plus the
/// instance id that connection assigned to the fetch.
///
/// This is only a lookup key. The server never holds the connection through it.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub connection_id: ConnectionId,
    pub instance_id: u64,
}

impl ClientDescriptor {
    pub fn new(connection_id: ConnectionId, instance_id: u64) -> Self {
        Self {
            connection_id,
            instance_id,
        }
    }
}

impl fmt::Display for ClientDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.connection_id, self.instance_id)
    }
}
