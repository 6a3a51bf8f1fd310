use super::{SharedStore, StoreChanges};
use crate::error::StoreError;

/// Stand-in for environments without shared storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl SharedStore for NullStore {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn changes(&self) -> StoreChanges {
        StoreChanges::closed()
    }

    fn is_available(&self) -> bool {
        false
    }
}
