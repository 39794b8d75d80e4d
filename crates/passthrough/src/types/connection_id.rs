use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin id of a simulated client connection. Unique for the lifetime of a
/// cluster controller and stable across fail-over.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
