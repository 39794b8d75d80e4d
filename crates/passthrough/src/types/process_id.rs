use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one server process incarnation.
///
/// A restarted server gets a fresh id, which is how clients tell messages from
/// a stale process apart from messages of the one they are attached to.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process-{}", self.0)
    }
}
