//! Results of entity lifecycle operations, kept so a re-sent create,
//! reconfigure or destroy replays the original answer instead of running
//! twice.

use crate::error::{EntityError, PassthroughError};
use crate::storage::{load_element, store_element, PlatformPersistence};
use crate::types::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Persistence element holding recorded outcomes.
pub const LIFECYCLE_ELEMENT: &str = "lifecycle.map";

/// What a lifecycle operation returned the first time it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifeCycleOutcome {
    Success(Vec<u8>),
    Failure(EntityError),
}

impl LifeCycleOutcome {
    pub fn into_result(self) -> Result<Vec<u8>, EntityError> {
        match self {
            LifeCycleOutcome::Success(bytes) => Ok(bytes),
            LifeCycleOutcome::Failure(error) => Err(error),
        }
    }
}

impl From<Result<Vec<u8>, EntityError>> for LifeCycleOutcome {
    fn from(result: Result<Vec<u8>, EntityError>) -> Self {
        match result {
            Ok(bytes) => LifeCycleOutcome::Success(bytes),
            Err(error) => LifeCycleOutcome::Failure(error),
        }
    }
}

pub struct LifeCycleMessageHandler {
    persistence: Arc<dyn PlatformPersistence>,
    outcomes: HashMap<ConnectionId, BTreeMap<u64, LifeCycleOutcome>>,
}

impl LifeCycleMessageHandler {
    pub fn new(
        persistence: Arc<dyn PlatformPersistence>,
        should_load: bool,
    ) -> Result<Self, PassthroughError> {
        let outcomes = if should_load {
            load_element(persistence.as_ref(), LIFECYCLE_ELEMENT)?.unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            persistence,
            outcomes,
        })
    }

    /// The recorded outcome of `transaction_id` from `origin`, if it already
    /// ran.
    pub fn did_already_handle(
        &self,
        origin: ConnectionId,
        transaction_id: u64,
    ) -> Option<LifeCycleOutcome> {
        self.outcomes
            .get(&origin)
            .and_then(|per_client| per_client.get(&transaction_id))
            .cloned()
    }

    /// Records an outcome and forgets everything of the same client below
    /// its oldest in-flight transaction.
    pub fn record(
        &mut self,
        origin: ConnectionId,
        transaction_id: u64,
        oldest_transaction_id: u64,
        outcome: LifeCycleOutcome,
    ) -> Result<(), PassthroughError> {
        let per_client = self.outcomes.entry(origin).or_default();
        per_client.insert(transaction_id, outcome);
        // split_off keeps keys >= oldest in the returned half.
        let kept = per_client.split_off(&oldest_transaction_id);
        *per_client = kept;
        store_element(self.persistence.as_ref(), LIFECYCLE_ELEMENT, &self.outcomes)
    }

    pub fn success(
        &mut self,
        origin: ConnectionId,
        transaction_id: u64,
        oldest_transaction_id: u64,
        response: Vec<u8>,
    ) -> Result<(), PassthroughError> {
        self.record(
            origin,
            transaction_id,
            oldest_transaction_id,
            LifeCycleOutcome::Success(response),
        )
    }

    pub fn failure(
        &mut self,
        origin: ConnectionId,
        transaction_id: u64,
        oldest_transaction_id: u64,
        error: EntityError,
    ) -> Result<(), PassthroughError> {
        self.record(
            origin,
            transaction_id,
            oldest_transaction_id,
            LifeCycleOutcome::Failure(error),
        )
    }

    pub fn recorded_len(&self) -> usize {
        self.outcomes.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_persistence::MemoryPersistence;
    use crate::types::EntityTuple;

    fn handler(storage: &MemoryPersistence, load: bool) -> LifeCycleMessageHandler {
        LifeCycleMessageHandler::new(Arc::new(storage.clone()), load).unwrap()
    }

    #[test]
    fn replays_recorded_outcomes() {
        let storage = MemoryPersistence::new();
        let mut lifecycle = handler(&storage, false);
        let tuple = EntityTuple::new("counter", "a");

        assert_eq!(lifecycle.did_already_handle(ConnectionId(1), 4), None);
        lifecycle.success(ConnectionId(1), 4, 1, vec![]).unwrap();
        lifecycle
            .failure(ConnectionId(1), 5, 1, EntityError::already_exists(&tuple))
            .unwrap();

        assert_eq!(
            lifecycle.did_already_handle(ConnectionId(1), 4),
            Some(LifeCycleOutcome::Success(vec![]))
        );
        assert_eq!(
            lifecycle
                .did_already_handle(ConnectionId(1), 5)
                .map(LifeCycleOutcome::into_result),
            Some(Err(EntityError::already_exists(&tuple)))
        );
        assert_eq!(lifecycle.did_already_handle(ConnectionId(2), 4), None);
    }

    #[test]
    fn watermark_prunes_older_outcomes_of_the_same_client() {
        let storage = MemoryPersistence::new();
        let mut lifecycle = handler(&storage, false);
        lifecycle.success(ConnectionId(1), 1, 1, vec![1]).unwrap();
        lifecycle.success(ConnectionId(2), 1, 1, vec![1]).unwrap();
        lifecycle.success(ConnectionId(1), 2, 1, vec![2]).unwrap();
        lifecycle.success(ConnectionId(1), 3, 3, vec![3]).unwrap();

        assert_eq!(lifecycle.did_already_handle(ConnectionId(1), 1), None);
        assert_eq!(lifecycle.did_already_handle(ConnectionId(1), 2), None);
        assert!(lifecycle.did_already_handle(ConnectionId(1), 3).is_some());
        assert!(lifecycle.did_already_handle(ConnectionId(2), 1).is_some());
        assert_eq!(lifecycle.recorded_len(), 2);
    }

    #[test]
    fn outcomes_survive_a_restart() {
        let storage = MemoryPersistence::new();
        handler(&storage, false)
            .success(ConnectionId(3), 9, 9, vec![7])
            .unwrap();

        let reloaded = handler(&storage, true);
        assert_eq!(
            reloaded.did_already_handle(ConnectionId(3), 9),
            Some(LifeCycleOutcome::Success(vec![7]))
        );
        assert_eq!(handler(&storage, false).recorded_len(), 0);
    }
}
