use crate::types::{ConnectionId, EntityTuple};
use serde::{Deserialize, Serialize};

/// Entity-level failures surfaced to clients.
///
/// These travel back over the wire inside exception messages, so they are
/// plain data: every variant carries the class and name of the entity the
/// failing request targeted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum EntityError {
    #[error("entity {class_name}:{entity_name} not found")]
    NotFound {
        class_name: String,
        entity_name: String,
    },

    #[error("entity {class_name}:{entity_name} already exists")]
    AlreadyExists {
        class_name: String,
        entity_name: String,
    },

    #[error("entity {class_name}:{entity_name} version mismatch: server has {expected}, client asked for {actual}")]
    VersionMismatch {
        class_name: String,
        entity_name: String,
        expected: u64,
        actual: u64,
    },

    #[error("no entity service provides class {class_name} (entity {entity_name})")]
    NotProvided {
        class_name: String,
        entity_name: String,
    },

    #[error("entity {class_name}:{entity_name} rejected its configuration: {reason}")]
    Configuration {
        class_name: String,
        entity_name: String,
        reason: String,
    },

    #[error("entity {class_name}:{entity_name} failed on the server: {description}")]
    Server {
        class_name: String,
        entity_name: String,
        description: String,
    },
}

impl EntityError {
    pub fn not_found(tuple: &EntityTuple) -> Self {
        Self::NotFound {
            class_name: tuple.class_name.clone(),
            entity_name: tuple.entity_name.clone(),
        }
    }

    pub fn already_exists(tuple: &EntityTuple) -> Self {
        Self::AlreadyExists {
            class_name: tuple.class_name.clone(),
            entity_name: tuple.entity_name.clone(),
        }
    }

    pub fn not_provided(tuple: &EntityTuple) -> Self {
        Self::NotProvided {
            class_name: tuple.class_name.clone(),
            entity_name: tuple.entity_name.clone(),
        }
    }

    pub fn version_mismatch(tuple: &EntityTuple, expected: u64, actual: u64) -> Self {
        Self::VersionMismatch {
            class_name: tuple.class_name.clone(),
            entity_name: tuple.entity_name.clone(),
            expected,
            actual,
        }
    }

    pub fn configuration(tuple: &EntityTuple, reason: impl Into<String>) -> Self {
        Self::Configuration {
            class_name: tuple.class_name.clone(),
            entity_name: tuple.entity_name.clone(),
            reason: reason.into(),
        }
    }

    pub fn server(tuple: &EntityTuple, description: impl Into<String>) -> Self {
        Self::Server {
            class_name: tuple.class_name.clone(),
            entity_name: tuple.entity_name.clone(),
            description: description.into(),
        }
    }
}

/// Errors that can occur in the stripe emulation.
#[derive(Debug, thiserror::Error)]
pub enum PassthroughError {
    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("persistence error: {reason}")]
    PersistenceError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("server process {server} is not running")]
    ServerNotRunning { server: String },

    #[error("connection {connection} is closed")]
    ConnectionClosed { connection: ConnectionId },

    #[error("no active server in the stripe")]
    NoActiveServer,

    #[error("service lookup for {service} matched {providers} providers")]
    AmbiguousService {
        service: &'static str,
        providers: usize,
    },

    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl PassthroughError {
    /// The entity error carried by this error, if any.
    pub fn as_entity_error(&self) -> Option<&EntityError> {
        match self {
            Self::Entity(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let tuple = EntityTuple::new("counter", "a");
        assert_eq!(
            EntityError::not_found(&tuple).to_string(),
            "entity counter:a not found"
        );
        assert_eq!(
            EntityError::version_mismatch(&tuple, 2, 1).to_string(),
            "entity counter:a version mismatch: server has 2, client asked for 1"
        );

        let err = PassthroughError::MalformedMessage {
            reason: "short header".into(),
            source: None,
        };
        assert_eq!(err.to_string(), "malformed message: short header");

        let err = PassthroughError::from(EntityError::already_exists(&tuple));
        assert_eq!(err.to_string(), "entity counter:a already exists");
        assert!(matches!(
            err.as_entity_error(),
            Some(EntityError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn entity_errors_survive_the_wire() {
        let err = EntityError::server(&EntityTuple::new("map", "m"), "boom");
        let bytes = rmp_serde::to_vec(&err).unwrap();
        let decoded: EntityError = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(err, decoded);
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PassthroughError>();
        assert_send_sync::<EntityError>();
    }
}
