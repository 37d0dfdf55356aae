//! Contract of the hosted face service and its wire types.
//!
//! The service exchanges JSON. Images travel as data URIs
//! (`data:image/jpeg;base64,...`) inside a JSON array.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::Result;
use crate::core::token::TokenPair;

/// Recognition engine selected per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Iobroker,
    Advanced,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Iobroker => "iobroker",
            Engine::Advanced => "advanced",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "iobroker" => Ok(Engine::Iobroker),
            "advanced" => Ok(Engine::Advanced),
            other => Err(format!("unknown engine '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EngineUsage {
    #[serde(default)]
    pub monthly: u64,
    #[serde(default)]
    pub daily: u64,
    #[serde(default)]
    pub last_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineLimits {
    #[serde(default)]
    pub daily: u64,
    #[serde(default)]
    pub monthly: u64,
}

/// Per-account consumption the service attaches to most responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    #[serde(default)]
    pub usage: HashMap<String, EngineUsage>,
    #[serde(default)]
    pub limits: HashMap<String, EngineLimits>,
    /// Milliseconds since epoch.
    #[serde(default)]
    pub license_till: i64,
}

impl UsageStats {
    /// One line per engine, e.g. `iobroker: daily 3/10, monthly 40/300`.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut engines: Vec<&String> = self.limits.keys().chain(self.usage.keys()).collect();
        engines.sort();
        engines.dedup();

        engines
            .into_iter()
            .map(|engine| {
                let used = self.usage.get(engine).cloned().unwrap_or_default();
                let limits = self.limits.get(engine).cloned().unwrap_or_default();
                let over = used.daily > limits.daily || used.monthly > limits.monthly;
                format!(
                    "{}: daily {}/{}, monthly {}/{}{}",
                    engine, used.daily, limits.daily, used.monthly, limits.monthly,
                    if over { " (limit exceeded)" } else { "" }
                )
            })
            .collect()
    }

    pub fn usage_for(&self, engine: Engine) -> Option<&EngineUsage> {
        self.usage.get(engine.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentStatus {
    #[serde(default)]
    pub enrolled: bool,
    #[serde(default)]
    pub monthly: u64,
    #[serde(default)]
    pub daily: u64,
    #[serde(default)]
    pub last_time: i64,
}

/// A person as the service knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub iobroker: Option<EnrollmentStatus>,
    #[serde(default)]
    pub advanced: Option<EnrollmentStatus>,
}

impl PersonRecord {
    pub fn status(&self, engine: Engine) -> Option<&EnrollmentStatus> {
        match engine {
            Engine::Iobroker => self.iobroker.as_ref(),
            Engine::Advanced => self.advanced.as_ref(),
        }
    }

    pub fn is_enrolled(&self, engine: Engine) -> bool {
        self.status(engine).map(|s| s.enrolled).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PersonList {
    #[serde(default)]
    pub persons: Vec<PersonRecord>,
    #[serde(default)]
    pub stats: Option<UsageStats>,
}

/// Enroll response. Older service revisions answer with a bare boolean;
/// that shape is accepted as `enrolled` without stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(from = "EnrollWire")]
pub struct EnrollOutcome {
    pub enrolled: bool,
    pub stats: Option<UsageStats>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EnrollWire {
    Detailed {
        #[serde(default)]
        enrolled: bool,
        #[serde(default)]
        stats: Option<UsageStats>,
    },
    Bare(bool),
}

impl From<EnrollWire> for EnrollOutcome {
    fn from(wire: EnrollWire) -> Self {
        match wire {
            EnrollWire::Detailed { enrolled, stats } => EnrollOutcome { enrolled, stats },
            EnrollWire::Bare(enrolled) => EnrollOutcome { enrolled, stats: None },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonResult {
    pub person: String,
    pub result: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VerifyOutcome {
    /// Request-level failure reported by the service.
    #[serde(default)]
    pub error: Option<String>,
    /// Matched person, if any.
    #[serde(default)]
    pub person: Option<String>,
    #[serde(default)]
    pub results: Vec<PersonResult>,
    /// One entry per rejected image.
    #[serde(default)]
    pub errors: Option<Vec<String>>,
    #[serde(default)]
    pub stats: Option<UsageStats>,
}

/// Person mutation. Editing may rename the id.
#[derive(Debug, Clone, PartialEq)]
pub enum PersonChange {
    Add { name: String },
    Edit { id: String, name: String },
}

#[async_trait]
pub trait FaceService: Send + Sync {
    /// Exchanges login/password for a fresh token pair.
    async fn token(&self, login: &str, password: &str) -> Result<TokenPair>;

    /// Mints a new pair from an unexpired refresh token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenPair>;

    async fn list_persons(&self, access_token: &str) -> Result<PersonList>;

    async fn enroll(
        &self,
        access_token: &str,
        engine: Engine,
        images: &[String],
        person_id: &str,
    ) -> Result<EnrollOutcome>;

    /// `person_id = None` asks the service to match against every person.
    async fn verify(
        &self,
        access_token: &str,
        engine: Engine,
        images: &[String],
        person_id: Option<&str>,
    ) -> Result<VerifyOutcome>;

    /// Returns the number of persons after the change.
    async fn add_or_edit_person(
        &self,
        access_token: &str,
        person_id: &str,
        change: &PersonChange,
    ) -> Result<usize>;

    /// Returns the number of persons left.
    async fn delete_person(&self, access_token: &str, person_id: &str) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enroll_accepts_both_response_shapes() {
        let detailed: EnrollOutcome = serde_json::from_str(
            r#"{"enrolled":true,"stats":{"usage":{"iobroker":{"monthly":4,"daily":1,"lastTime":1700000000000}},"limits":{"iobroker":{"daily":10,"monthly":100}},"licenseTill":0}}"#,
        )
        .unwrap();
        assert!(detailed.enrolled);
        let stats = detailed.stats.unwrap();
        assert_eq!(stats.usage_for(Engine::Iobroker).unwrap().monthly, 4);
        assert_eq!(stats.limits["iobroker"].daily, 10);

        let bare: EnrollOutcome = serde_json::from_str("false").unwrap();
        assert_eq!(bare, EnrollOutcome { enrolled: false, stats: None });
    }

    #[test]
    fn verify_response_with_itemized_errors() {
        let outcome: VerifyOutcome = serde_json::from_str(
            r#"{"results":[{"person":"anna","result":false,"error":"Error: face too small"}],"errors":["image 2: no face"]}"#,
        )
        .unwrap();
        assert_eq!(outcome.person, None);
        assert_eq!(outcome.results[0].error.as_deref(), Some("Error: face too small"));
        assert_eq!(outcome.errors.unwrap(), vec!["image 2: no face".to_string()]);
    }

    #[test]
    fn person_list_reads_engine_status() {
        let list: PersonList = serde_json::from_str(
            r#"{"persons":[{"id":"anna","name":"Anna","iobroker":{"enrolled":true,"monthly":2,"daily":0,"lastTime":0}},{"id":"ben","name":"Ben"}]}"#,
        )
        .unwrap();
        assert!(list.persons[0].is_enrolled(Engine::Iobroker));
        assert!(!list.persons[0].is_enrolled(Engine::Advanced));
        assert!(!list.persons[1].is_enrolled(Engine::Iobroker));
        assert!(list.stats.is_none());
    }

    #[test]
    fn usage_summary_flags_exceeded_limits() {
        let mut stats = UsageStats::default();
        stats.usage.insert("advanced".to_string(), EngineUsage { monthly: 11, daily: 2, last_time: 0 });
        stats.limits.insert("advanced".to_string(), EngineLimits { daily: 5, monthly: 10 });

        let lines = stats.summary_lines();
        assert_eq!(lines, vec!["advanced: daily 2/5, monthly 11/10 (limit exceeded)".to_string()]);
    }

    #[test]
    fn engine_round_trips_through_its_name() {
        assert_eq!("advanced".parse::<Engine>().unwrap(), Engine::Advanced);
        assert!("other".parse::<Engine>().is_err());
    }
}
