//! Service calls as the user sees them: token first, then the request,
//! then a short report.

use std::sync::Arc;

use crate::common::{FaceLinkError, Result};
use crate::core::token_manager::TokenManager;
use crate::service::face_api::{
    Engine, FaceService, PersonChange, PersonList, PersonRecord, UsageStats, VerifyOutcome,
};

pub const MAX_PERSON_ID_LEN: usize = 16;

/// Ids are short lowercase ASCII alphanumerics, unique among `existing`.
/// `editing` names the person being renamed, which may keep its id.
pub fn validate_person_id(id: &str, existing: &[PersonRecord], editing: Option<&str>) -> Result<()> {
    if id.is_empty() {
        return Err(FaceLinkError::Validation("Empty ID is not allowed".into()));
    }
    if id.len() > MAX_PERSON_ID_LEN {
        return Err(FaceLinkError::Validation(format!(
            "ID is too long. Max {} characters",
            MAX_PERSON_ID_LEN
        )));
    }
    if !id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(FaceLinkError::Validation("Only lowercase a-z and digits are allowed".into()));
    }
    if existing.iter().any(|p| p.id == id && Some(p.id.as_str()) != editing) {
        return Err(FaceLinkError::Validation("ID must be unique".into()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EnrollReport {
    pub person_id: String,
    pub enrolled: bool,
    pub images: usize,
    pub stats: Option<UsageStats>,
}

impl EnrollReport {
    pub fn summary(&self) -> String {
        if self.enrolled {
            format!("Enrolled {} with {} image(s)", self.person_id, self.images)
        } else {
            format!("Service did not enroll {}", self.person_id)
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// Person the images were checked against, `None` for all persons.
    pub expected: Option<String>,
    pub outcome: VerifyOutcome,
}

impl VerifyReport {
    /// Against one person only that person counts; otherwise any match does.
    pub fn matched(&self) -> Option<&str> {
        let person = self.outcome.person.as_deref()?;
        match self.expected.as_deref() {
            Some(expected) if expected != person => None,
            _ => Some(person),
        }
    }

    pub fn summary(&self) -> String {
        if let Some(person) = self.matched() {
            return format!("Recognized {}", person);
        }

        let mut lines = vec![match &self.expected {
            Some(expected) => format!("Not recognized as {}", expected),
            None => "Nobody recognized".to_string(),
        }];

        if let Some(error) = &self.outcome.error {
            lines.push(error.clone());
        }
        for result in self.outcome.results.iter().filter(|r| !r.result) {
            let reason = result
                .error
                .as_deref()
                .map(|e| e.trim_start_matches("Error: "))
                .unwrap_or("Unknown error");
            lines.push(format!("  {}: {}", result.person, reason));
        }
        if let Some(errors) = &self.outcome.errors {
            for (i, error) in errors.iter().enumerate() {
                lines.push(format!("  image {}: {}", i, error));
            }
        }

        lines.join("\n")
    }
}

pub struct FaceWorkflow {
    tokens: Arc<TokenManager>,
    service: Arc<dyn FaceService>,
    engine: Engine,
}

impl FaceWorkflow {
    pub fn new(tokens: Arc<TokenManager>, service: Arc<dyn FaceService>, engine: Engine) -> Self {
        Self { tokens, service, engine }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub async fn list_persons(&self) -> Result<PersonList> {
        let access = self.tokens.ensure_valid_access_token().await?;
        self.service.list_persons(&access).await
    }

    pub async fn enroll(&self, person_id: &str, images: &[String]) -> Result<EnrollReport> {
        if images.is_empty() {
            return Err(FaceLinkError::NoImages);
        }
        let access = self.tokens.ensure_valid_access_token().await?;

        tracing::info!("Enrolling {} with {} image(s) on {}", person_id, images.len(), self.engine);
        let outcome = self.service.enroll(&access, self.engine, images, person_id).await?;

        Ok(EnrollReport {
            person_id: person_id.to_string(),
            enrolled: outcome.enrolled,
            images: images.len(),
            stats: outcome.stats,
        })
    }

    pub async fn verify(&self, person_id: Option<&str>, images: &[String]) -> Result<VerifyReport> {
        if images.is_empty() {
            return Err(FaceLinkError::NoImages);
        }
        let access = self.tokens.ensure_valid_access_token().await?;

        tracing::info!(
            "Verifying {} image(s) against {}",
            images.len(),
            person_id.unwrap_or("all persons")
        );
        let outcome = self.service.verify(&access, self.engine, images, person_id).await?;

        Ok(VerifyReport { expected: person_id.map(str::to_string), outcome })
    }

    /// Adds a person, checking the id against the current list first.
    pub async fn add_person(&self, id: &str, name: &str) -> Result<usize> {
        let current = self.list_persons().await?;
        validate_person_id(id, &current.persons, None)?;

        let access = self.tokens.ensure_valid_access_token().await?;
        let change = PersonChange::Add { name: name.to_string() };
        self.service.add_or_edit_person(&access, id, &change).await
    }

    /// Renames a person and optionally changes its id.
    pub async fn edit_person(&self, id: &str, new_id: &str, name: &str) -> Result<usize> {
        let current = self.list_persons().await?;
        if !current.persons.iter().any(|p| p.id == id) {
            return Err(FaceLinkError::Validation(format!("Unknown person {}", id)));
        }
        validate_person_id(new_id, &current.persons, Some(id))?;

        let access = self.tokens.ensure_valid_access_token().await?;
        let change = PersonChange::Edit { id: new_id.to_string(), name: name.to_string() };
        self.service.add_or_edit_person(&access, id, &change).await
    }

    pub async fn delete_person(&self, id: &str) -> Result<usize> {
        let access = self.tokens.ensure_valid_access_token().await?;
        self.service.delete_person(&access, id).await
    }
}
