use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::{FaceLinkError, Result};
use crate::storage::{CredentialStore, StoreChange, Subscription};

const STORAGE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct StoredValue {
    val: String,
    ack: bool,
    /// Milliseconds since epoch of the last write.
    ts: i64,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    values: HashMap<String, StoredValue>,
}

/// JSON-file backed slot shared by both binaries.
///
/// Writes go to a temporary file that is renamed over the original, so a
/// reader never sees a half-written record. Other processes' writes surface
/// through [`FileCredentialStore::spawn_poller`].
pub struct FileCredentialStore {
    path: PathBuf,
    changes: broadcast::Sender<StoreChange>,
    /// Last contents this process wrote or observed.
    known: Mutex<HashMap<String, StoredValue>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let (changes, _) = broadcast::channel(64);
        let store = Self {
            path,
            changes,
            known: Mutex::new(HashMap::new()),
            last_modified: Mutex::new(None),
        };

        let initial = store.read_file()?;
        *store.known.lock().unwrap_or_else(PoisonError::into_inner) = initial.values;
        *store.last_modified.lock().unwrap_or_else(PoisonError::into_inner) = store.modified_time();

        tracing::debug!("Credential store at {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<StoreFile> {
        if !self.path.exists() {
            return Ok(StoreFile { version: STORAGE_VERSION, values: HashMap::new() });
        }

        let data = fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(StoreFile { version: STORAGE_VERSION, values: HashMap::new() });
        }

        let mut file: StoreFile = serde_json::from_str(&data)
            .map_err(|e| FaceLinkError::Storage(format!("Failed to deserialize {}: {}", self.path.display(), e)))?;

        if file.version < STORAGE_VERSION {
            file.version = STORAGE_VERSION;
        }
        Ok(file)
    }

    fn write_file(&self, file: &StoreFile) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(file)
            .map_err(|e| FaceLinkError::Storage(format!("Failed to serialize: {}", e)))?;

        // One temp file per write; two processes may save at the same time.
        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&encoded)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| FaceLinkError::Io(e.error))?;
        Ok(())
    }

    fn modified_time(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Re-reads the file if it changed on disk and broadcasts every key whose
    /// value differs from what this process last saw. Returns the number of
    /// changes emitted.
    pub fn poll_changes(&self) -> Result<usize> {
        let modified = self.modified_time();
        {
            let last = self.last_modified.lock().unwrap_or_else(PoisonError::into_inner);
            if modified.is_some() && *last == modified {
                return Ok(0);
            }
        }

        let current = self.read_file()?.values;
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        let mut emitted = 0;

        for (key, value) in &current {
            if known.get(key) != Some(value) {
                let _ = self.changes.send(StoreChange {
                    key: key.clone(),
                    value: Some(value.val.clone()),
                    ack: value.ack,
                });
                emitted += 1;
            }
        }
        for key in known.keys() {
            if !current.contains_key(key) {
                let _ = self.changes.send(StoreChange { key: key.clone(), value: None, ack: true });
                emitted += 1;
            }
        }

        *known = current;
        *self.last_modified.lock().unwrap_or_else(PoisonError::into_inner) = modified;
        Ok(emitted)
    }

    /// Polls the file until cancelled. Each check is scheduled only after the
    /// previous one finished.
    pub fn spawn_poller(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        if let Err(e) = store.poll_changes() {
                            tracing::warn!("Credential store poll failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Credential store poller stopped");
        })
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let file = self.read_file()?;
        Ok(file.values.get(key).map(|v| v.val.clone()))
    }

    fn set(&self, key: &str, value: &str, ack: bool) -> Result<()> {
        let mut file = self.read_file()?;
        file.version = STORAGE_VERSION;
        let stored = StoredValue {
            val: value.to_string(),
            ack,
            ts: chrono::Utc::now().timestamp_millis(),
        };
        file.values.insert(key.to_string(), stored.clone());
        self.write_file(&file)?;

        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), stored);
        *self.last_modified.lock().unwrap_or_else(PoisonError::into_inner) = self.modified_time();

        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            value: Some(value.to_string()),
            ack,
        });
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Subscription {
        Subscription::new(key, self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let store = FileCredentialStore::new(&path).unwrap();
        store.set("info.tokens", r#"{"access_token":"a","refresh_token":"r"}"#, true).unwrap();

        let reopened = FileCredentialStore::new(&path).unwrap();
        assert_eq!(
            reopened.get("info.tokens").unwrap().as_deref(),
            Some(r#"{"access_token":"a","refresh_token":"r"}"#)
        );
        assert_eq!(reopened.get("other").unwrap(), None);
    }

    #[test]
    fn concurrent_writers_never_see_a_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let writers: Vec<_> = ["ui", "agent"]
            .into_iter()
            .map(|side| {
                let store = FileCredentialStore::new(&path).unwrap();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.set("info.tokens", &format!("{}-{}", side, i), true).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let last = FileCredentialStore::new(&path).unwrap().get("info.tokens").unwrap().unwrap();
        assert!(last == "ui-99" || last == "agent-99");
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("credentials.json")]);
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(FileCredentialStore::new(&path), Err(FaceLinkError::Storage(_))));
    }

    #[tokio::test]
    async fn foreign_writes_are_broadcast_by_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let ui = FileCredentialStore::new(&path).unwrap();
        let agent = FileCredentialStore::new(&path).unwrap();
        let mut sub = agent.subscribe("info.tokens");

        ui.set("info.tokens", "pair-1", true).unwrap();
        // Force a re-read even if the filesystem timestamp granularity hides the write.
        *agent.last_modified.lock().unwrap() = None;

        assert_eq!(agent.poll_changes().unwrap(), 1);
        let change = sub.changed().await.unwrap();
        assert_eq!(change.value.as_deref(), Some("pair-1"));

        *agent.last_modified.lock().unwrap() = None;
        assert_eq!(agent.poll_changes().unwrap(), 0);
    }
}
