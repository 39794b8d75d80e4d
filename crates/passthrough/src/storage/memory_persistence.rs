use crate::error::PassthroughError;
use crate::storage::PlatformPersistence;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory persistence that outlives the server processes using it.
///
/// Clones share the same elements, so a server that is stopped and started
/// again sees what it stored before.
#[derive(Debug, Clone)]
pub struct MemoryPersistence {
    elements: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            elements: Arc::new(DashMap::new()),
        }
    }

    /// Names of every stored element, sorted.
    pub fn element_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.elements.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.elements.clear();
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformPersistence for MemoryPersistence {
    fn load_data_element(&self, name: &str) -> Result<Option<Vec<u8>>, PassthroughError> {
        Ok(self.elements.get(name).map(|v| v.value().clone()))
    }

    fn store_data_element(&self, name: &str, data: &[u8]) -> Result<(), PassthroughError> {
        self.elements.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn remove_data_elements(&self, prefix: &str) -> Result<(), PassthroughError> {
        self.elements.retain(|name, _| !name.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{load_element, store_element};

    #[test]
    fn clones_share_elements() {
        let storage = MemoryPersistence::new();
        let other = storage.clone();
        storage.store_data_element("a", &[1, 2]).unwrap();
        assert_eq!(other.load_data_element("a").unwrap(), Some(vec![1, 2]));
        assert_eq!(other.load_data_element("missing").unwrap(), None);
        assert_eq!(other.element_names(), vec!["a".to_string()]);
    }

    #[test]
    fn removal_by_prefix_keeps_other_elements() {
        let storage = MemoryPersistence::new();
        storage.store_data_element("consumer-1/value", &[1]).unwrap();
        storage.store_data_element("consumer-1/other", &[2]).unwrap();
        storage.store_data_element("consumer-12/value", &[3]).unwrap();
        storage.remove_data_elements("consumer-1/").unwrap();
        assert_eq!(storage.element_names(), vec!["consumer-12/value".to_string()]);
    }

    #[test]
    fn typed_elements_round_trip() {
        let storage = MemoryPersistence::new();
        store_element(&storage, "list", &vec![(1u64, 2u64), (3, 4)]).unwrap();
        let loaded: Option<Vec<(u64, u64)>> = load_element(&storage, "list").unwrap();
        assert_eq!(loaded, Some(vec![(1, 2), (3, 4)]));
    }

    #[test]
    fn undecodable_element_is_a_persistence_error() {
        let storage = MemoryPersistence::new();
        storage.store_data_element("list", &[0xc1]).unwrap();
        let err = load_element::<Vec<u64>>(&storage, "list").unwrap_err();
        assert!(err.to_string().contains("failed to decode element list"), "got: {err}");
    }
}
