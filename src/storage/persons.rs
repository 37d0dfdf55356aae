use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::common::{FaceLinkError, Result};
use crate::service::face_api::{Engine, PersonRecord};

/// Local read-only copy of a cloud person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPerson {
    pub id: String,
    pub name: String,
    /// Set by the last verification that matched this person.
    #[serde(default)]
    pub detected: bool,
    #[serde(default)]
    pub enrolled_iobroker: bool,
    #[serde(default)]
    pub enrolled_advanced: bool,
}

impl LocalPerson {
    fn from_record(record: &PersonRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            detected: false,
            enrolled_iobroker: record.is_enrolled(Engine::Iobroker),
            enrolled_advanced: record.is_enrolled(Engine::Advanced),
        }
    }

    pub fn is_enrolled(&self, engine: Engine) -> bool {
        match engine {
            Engine::Iobroker => self.enrolled_iobroker,
            Engine::Advanced => self.enrolled_advanced,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub renamed: Vec<String>,
    pub removed: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.renamed.is_empty() && self.removed.is_empty()
    }
}

pub struct PersonMirror {
    persons: BTreeMap<String, LocalPerson>,
    path: Option<PathBuf>,
}

impl PersonMirror {
    /// Mirror that lives only in memory.
    pub fn in_memory() -> Self {
        Self { persons: BTreeMap::new(), path: None }
    }

    /// Loads the mirror from `path`, starting empty when the file is missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let persons = if path.exists() {
            let data = fs::read_to_string(&path)?;
            let list: Vec<LocalPerson> = serde_json::from_str(&data)
                .map_err(|e| FaceLinkError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
            list.into_iter().map(|p| (p.id.clone(), p)).collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self { persons, path: Some(path) })
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let list: Vec<&LocalPerson> = self.persons.values().collect();
        let encoded = serde_json::to_vec_pretty(&list)
            .map_err(|e| FaceLinkError::Storage(format!("Failed to serialize persons: {}", e)))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Brings the mirror in line with the cloud list: unknown persons are
    /// created, renamed ones updated, vanished ones removed.
    pub fn sync(&mut self, cloud: &[PersonRecord]) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let stale: Vec<String> = self
            .persons
            .keys()
            .filter(|id| !cloud.iter().any(|p| &p.id == *id))
            .cloned()
            .collect();
        for id in stale {
            self.persons.remove(&id);
            report.removed.push(id);
        }

        for record in cloud {
            match self.persons.get_mut(&record.id) {
                Some(local) => {
                    if local.name != record.name {
                        local.name = record.name.clone();
                        report.renamed.push(record.id.clone());
                    }
                    local.enrolled_iobroker = record.is_enrolled(Engine::Iobroker);
                    local.enrolled_advanced = record.is_enrolled(Engine::Advanced);
                }
                None => {
                    self.persons.insert(record.id.clone(), LocalPerson::from_record(record));
                    report.added.push(record.id.clone());
                }
            }
        }

        self.save()?;
        tracing::info!(
            "Person mirror synced: {} added, {} renamed, {} removed",
            report.added.len(), report.renamed.len(), report.removed.len()
        );
        Ok(report)
    }

    /// Raises `detected` for the matched person and lowers it for everyone else.
    pub fn apply_match(&mut self, matched: Option<&str>) -> Result<()> {
        for person in self.persons.values_mut() {
            person.detected = matched == Some(person.id.as_str());
        }
        self.save()
    }

    pub fn get(&self, id: &str) -> Option<&LocalPerson> {
        self.persons.get(id)
    }

    pub fn persons(&self) -> impl Iterator<Item = &LocalPerson> {
        self.persons.values()
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }
}
