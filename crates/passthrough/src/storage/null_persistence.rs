use crate::error::PassthroughError;
use crate::storage::PlatformPersistence;

/// Persistence that keeps nothing. A server using it always starts empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPersistence;

impl PlatformPersistence for NullPersistence {
    fn load_data_element(&self, _name: &str) -> Result<Option<Vec<u8>>, PassthroughError> {
        Ok(None)
    }

    fn store_data_element(&self, _name: &str, _data: &[u8]) -> Result<(), PassthroughError> {
        Ok(())
    }

    fn remove_data_elements(&self, _prefix: &str) -> Result<(), PassthroughError> {
        Ok(())
    }
}
