use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::common::Result;
use crate::storage::{CredentialStore, StoreChange, Subscription};

/// In-process store. Two managers sharing one instance behave like the two
/// processes sharing the persisted slot.
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<String, (String, bool)>>,
    changes: broadcast::Sender<StoreChange>,
    writes: Mutex<Vec<StoreChange>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            values: Mutex::new(HashMap::new()),
            changes,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_value(key: &str, value: &str) -> Self {
        let store = Self::new();
        store
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value.to_string(), true));
        store
    }

    /// Every `set` call in order, for inspection.
    pub fn writes(&self) -> Vec<StoreChange> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: &str, ack: bool) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value.to_string(), ack));

        let change = StoreChange {
            key: key.to_string(),
            value: Some(value.to_string()),
            ack,
        };
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change.clone());
        // No receivers is fine.
        let _ = self.changes.send(change);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Subscription {
        Subscription::new(key, self.changes.subscribe())
    }
}
