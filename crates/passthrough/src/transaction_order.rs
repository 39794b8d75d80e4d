//! Global arrival order of client transactions, used to replay resends in
//! their original order after a fail-over.

use crate::error::PassthroughError;
use crate::storage::{load_element, store_element, PlatformPersistence};
use crate::types::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Persistence element holding the order list.
pub const TRANSACTION_ORDER_ELEMENT: &str = "transaction_order.map";

/// One client transaction, as recorded in arrival order.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientTransaction {
    pub connection_id: ConnectionId,
    pub transaction_id: u64,
}

/// Tracks transaction order and buffers resends of type `T` while a
/// reconnect is in progress.
pub struct TransactionOrderManager<T> {
    persistence: Arc<dyn PlatformPersistence>,
    order: Vec<ClientTransaction>,
    resends: Option<HashMap<ClientTransaction, T>>,
}

impl<T> TransactionOrderManager<T> {
    /// Creates the manager, reloading the persisted order when asked to.
    pub fn new(
        persistence: Arc<dyn PlatformPersistence>,
        should_load: bool,
    ) -> Result<Self, PassthroughError> {
        let order = if should_load {
            load_element(persistence.as_ref(), TRANSACTION_ORDER_ELEMENT)?.unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Self {
            persistence,
            order,
            resends: None,
        })
    }

    /// Records a transaction's arrival.
    ///
    /// Entries of the same connection below `oldest_on_connection` are
    /// finished and get dropped. A transaction already in the list keeps its
    /// original position.
    pub fn update_tracking(
        &mut self,
        connection_id: ConnectionId,
        transaction_id: u64,
        oldest_on_connection: u64,
    ) -> Result<(), PassthroughError> {
        self.order.retain(|entry| {
            entry.connection_id != connection_id || entry.transaction_id >= oldest_on_connection
        });
        let entry = ClientTransaction {
            connection_id,
            transaction_id,
        };
        if !self.order.contains(&entry) {
            self.order.push(entry);
        }
        store_element(self.persistence.as_ref(), TRANSACTION_ORDER_ELEMENT, &self.order)
    }

    pub fn start_handling_resends(&mut self) {
        self.resends = Some(HashMap::new());
    }

    pub fn is_handling_resends(&self) -> bool {
        self.resends.is_some()
    }

    /// Buffers a resend instead of running it. Returns the item back when not
    /// in resend mode.
    pub fn handle_resend(
        &mut self,
        connection_id: ConnectionId,
        transaction_id: u64,
        item: T,
    ) -> Option<T> {
        match self.resends.as_mut() {
            Some(resends) => {
                resends.insert(
                    ClientTransaction {
                        connection_id,
                        transaction_id,
                    },
                    item,
                );
                None
            }
            None => Some(item),
        }
    }

    /// Leaves resend mode and returns the buffered resends in run order:
    /// first those in the recorded order, then any the list never saw, by
    /// connection and transaction id.
    pub fn stop_handling_resends(&mut self) -> Vec<T> {
        let Some(mut resends) = self.resends.take() else {
            return Vec::new();
        };
        let mut run = Vec::with_capacity(resends.len());
        for entry in &self.order {
            if let Some(item) = resends.remove(entry) {
                run.push(item);
            }
        }
        let mut leftovers: Vec<(ClientTransaction, T)> = resends.into_iter().collect();
        leftovers.sort_by_key(|(entry, _)| (entry.connection_id, entry.transaction_id));
        run.extend(leftovers.into_iter().map(|(_, item)| item));
        run
    }

    pub fn tracked(&self) -> &[ClientTransaction] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_persistence::MemoryPersistence;
    use proptest::prelude::*;

    fn manager(storage: &MemoryPersistence, load: bool) -> TransactionOrderManager<&'static str> {
        TransactionOrderManager::new(Arc::new(storage.clone()), load).unwrap()
    }

    fn tx(connection: u64, transaction: u64) -> ClientTransaction {
        ClientTransaction {
            connection_id: ConnectionId(connection),
            transaction_id: transaction,
        }
    }

    #[test]
    fn watermark_prunes_only_its_own_connection() {
        let storage = MemoryPersistence::new();
        let mut order = manager(&storage, false);
        order.update_tracking(ConnectionId(1), 1, 1).unwrap();
        order.update_tracking(ConnectionId(2), 1, 1).unwrap();
        order.update_tracking(ConnectionId(1), 2, 1).unwrap();
        order.update_tracking(ConnectionId(1), 3, 3).unwrap();
        assert_eq!(order.tracked(), &[tx(2, 1), tx(1, 3)]);
    }

    #[test]
    fn order_survives_a_restart() {
        let storage = MemoryPersistence::new();
        let mut order = manager(&storage, false);
        order.update_tracking(ConnectionId(1), 5, 5).unwrap();
        order.update_tracking(ConnectionId(2), 9, 9).unwrap();

        assert_eq!(manager(&storage, true).tracked(), &[tx(1, 5), tx(2, 9)]);
        assert!(manager(&storage, false).tracked().is_empty());
    }

    #[test]
    fn resends_replay_in_recorded_order_then_leftovers() {
        let storage = MemoryPersistence::new();
        let mut order = manager(&storage, false);
        order.update_tracking(ConnectionId(2), 1, 1).unwrap();
        order.update_tracking(ConnectionId(1), 1, 1).unwrap();
        order.update_tracking(ConnectionId(2), 2, 1).unwrap();

        order.start_handling_resends();
        assert!(order.is_handling_resends());
        assert_eq!(order.handle_resend(ConnectionId(3), 7, "new"), None);
        assert_eq!(order.handle_resend(ConnectionId(2), 2, "c2t2"), None);
        assert_eq!(order.handle_resend(ConnectionId(1), 1, "c1t1"), None);
        assert_eq!(order.handle_resend(ConnectionId(2), 1, "c2t1"), None);

        assert_eq!(order.stop_handling_resends(), vec!["c2t1", "c1t1", "c2t2", "new"]);
        assert!(!order.is_handling_resends());
        assert_eq!(order.handle_resend(ConnectionId(1), 1, "late"), Some("late"));
    }

    #[test]
    fn repeated_transaction_keeps_first_position() {
        let storage = MemoryPersistence::new();
        let mut order = manager(&storage, false);
        order.update_tracking(ConnectionId(1), 1, 1).unwrap();
        order.update_tracking(ConnectionId(2), 1, 1).unwrap();
        order.update_tracking(ConnectionId(1), 1, 1).unwrap();
        assert_eq!(order.tracked(), &[tx(1, 1), tx(2, 1)]);
    }

    proptest! {
        #[test]
        fn buffered_subset_replays_in_list_order(
            arrivals in prop::collection::vec(0u64..4, 1..30),
            keep in prop::collection::vec(any::<bool>(), 30),
            shuffle_seed in Just((0usize..30).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let storage = MemoryPersistence::new();
            let mut order: TransactionOrderManager<ClientTransaction> =
                TransactionOrderManager::new(Arc::new(storage), false).unwrap();
            let mut next = [0u64; 4];
            let mut recorded = Vec::new();
            for connection in arrivals {
                next[connection as usize] += 1;
                let entry = tx(connection, next[connection as usize]);
                order.update_tracking(entry.connection_id, entry.transaction_id, 1).unwrap();
                recorded.push(entry);
            }

            let subset: Vec<ClientTransaction> = recorded
                .iter()
                .zip(keep.iter())
                .filter(|(_, keep)| **keep)
                .map(|(entry, _)| *entry)
                .collect();

            order.start_handling_resends();
            for index in shuffle_seed {
                if let Some(entry) = subset.get(index) {
                    order.handle_resend(entry.connection_id, entry.transaction_id, *entry);
                }
            }
            prop_assert_eq!(order.stop_handling_resends(), subset);
        }
    }
}
