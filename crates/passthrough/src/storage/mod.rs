//! Platform persistence: an opaque named-blob store.
//!
//! The server keeps its entity registry, transaction order, and life-cycle
//! records here so that a restarted server can pick up where it stopped.

pub mod memory_persistence;
pub mod null_persistence;

use crate::error::PassthroughError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Named-blob storage consumed by server processes.
///
/// Calls happen on the owning server's message loop, between message
/// executions, so implementations are synchronous.
pub trait PlatformPersistence: Send + Sync {
    /// Load a blob by name. `None` when nothing was stored under it.
    fn load_data_element(&self, name: &str) -> Result<Option<Vec<u8>>, PassthroughError>;

    /// Store a blob, replacing any previous value.
    fn store_data_element(&self, name: &str, data: &[u8]) -> Result<(), PassthroughError>;

    /// Drops every blob whose name starts with `prefix`.
    fn remove_data_elements(&self, prefix: &str) -> Result<(), PassthroughError>;
}

/// Loads and decodes a MessagePack element.
pub(crate) fn load_element<T: DeserializeOwned>(
    persistence: &dyn PlatformPersistence,
    name: &str,
) -> Result<Option<T>, PassthroughError> {
    let Some(bytes) = persistence.load_data_element(name)? else {
        return Ok(None);
    };
    rmp_serde::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PassthroughError::PersistenceError {
            reason: format!("failed to decode element {name}"),
            source: Some(Box::new(e)),
        })
}

/// Encodes a value as MessagePack and stores it.
pub(crate) fn store_element<T: Serialize>(
    persistence: &dyn PlatformPersistence,
    name: &str,
    value: &T,
) -> Result<(), PassthroughError> {
    let bytes = rmp_serde::to_vec(value).map_err(|e| PassthroughError::PersistenceError {
        reason: format!("failed to encode element {name}"),
        source: Some(Box::new(e)),
    })?;
    persistence.store_data_element(name, &bytes)
}
