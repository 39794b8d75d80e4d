use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a server-internal message so that retirement of other messages
/// can be made to wait on its completion.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MessageKey(pub u64);

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "internal-{}", self.0)
    }
}
