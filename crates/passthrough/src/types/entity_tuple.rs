use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an entity within a stripe: class name plus instance name.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntityTuple {
    pub class_name: String,
    pub entity_name: String,
}

impl EntityTuple {
    pub fn new(class_name: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            entity_name: entity_name.into(),
        }
    }
}

impl fmt::Display for EntityTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_name, self.entity_name)
    }
}
