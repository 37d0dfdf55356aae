//! Shared credential slot and the local person mirror.
//!
//! The credential slot is the only state shared between the interactive
//! side and the agent. Writers always store a complete serialized value;
//! readers learn about foreign writes through [`Subscription`].

pub mod file;
pub mod memory;
pub mod persons;

use tokio::sync::broadcast;

use crate::common::Result;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;
pub use persons::{LocalPerson, PersonMirror, SyncReport};

/// Notification emitted after a value changed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: String,
    /// `None` when the key was removed.
    pub value: Option<String>,
    /// Whether the writer marked the value as confirmed.
    pub ack: bool,
}

pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrites the whole value. An empty string clears the slot.
    fn set(&self, key: &str, value: &str, ack: bool) -> Result<()>;

    fn subscribe(&self, key: &str) -> Subscription;
}

/// Change feed for a single key.
pub struct Subscription {
    key: String,
    rx: broadcast::Receiver<StoreChange>,
}

impl Subscription {
    pub(crate) fn new(key: &str, rx: broadcast::Receiver<StoreChange>) -> Self {
        Self { key: key.to_string(), rx }
    }

    /// Waits for the next change of the subscribed key. Returns `None` once
    /// the store is gone.
    pub async fn changed(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.key == self.key => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Credential subscription for {} skipped {} changes", self.key, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
