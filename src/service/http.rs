use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::config::ServiceConfig;
use crate::common::Result;
use crate::core::token::TokenPair;
use crate::service::face_api::{
    Engine, EnrollOutcome, FaceService, PersonChange, PersonList, VerifyOutcome,
};

#[derive(Deserialize)]
struct PersonCount {
    #[serde(default)]
    persons: usize,
}

#[derive(Serialize)]
struct AddBody<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct EditBody<'a> {
    id: &'a str,
    name: &'a str,
}

/// [`FaceService`] over HTTPS.
pub struct HttpFaceService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFaceService {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("homeface/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, base_url: normalize_base_url(&config.base_url) })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn normalize_base_url(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    }
}

#[async_trait]
impl FaceService for HttpFaceService {
    async fn token(&self, login: &str, password: &str) -> Result<TokenPair> {
        let pair = self
            .client
            .get(self.url("token"))
            .basic_auth(login, Some(password))
            .send()
            .await?
            .error_for_status()?
            .json::<TokenPair>()
            .await?;
        Ok(pair)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenPair> {
        let pair = self
            .client
            .get(self.url("token"))
            .bearer_auth(refresh_token)
            .send()
            .await?
            .error_for_status()?
            .json::<TokenPair>()
            .await?;
        Ok(pair)
    }

    async fn list_persons(&self, access_token: &str) -> Result<PersonList> {
        let list = self
            .client
            .get(self.url("persons"))
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json::<PersonList>()
            .await?;
        Ok(list)
    }

    async fn enroll(
        &self,
        access_token: &str,
        engine: Engine,
        images: &[String],
        person_id: &str,
    ) -> Result<EnrollOutcome> {
        let outcome = self
            .client
            .post(self.url(&format!("enroll/{}", person_id)))
            .query(&[("engine", engine.as_str()), ("stats", "true")])
            .bearer_auth(access_token)
            .json(images)
            .send()
            .await?
            .error_for_status()?
            .json::<EnrollOutcome>()
            .await?;
        Ok(outcome)
    }

    async fn verify(
        &self,
        access_token: &str,
        engine: Engine,
        images: &[String],
        person_id: Option<&str>,
    ) -> Result<VerifyOutcome> {
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(3);
        if let Some(person) = person_id {
            query.push(("person", person));
        }
        query.push(("engine", engine.as_str()));
        query.push(("stats", "true"));

        let outcome = self
            .client
            .post(self.url("verify"))
            .query(&query)
            .bearer_auth(access_token)
            .json(images)
            .send()
            .await?
            .error_for_status()?
            .json::<VerifyOutcome>()
            .await?;
        Ok(outcome)
    }

    async fn add_or_edit_person(
        &self,
        access_token: &str,
        person_id: &str,
        change: &PersonChange,
    ) -> Result<usize> {
        let url = self.url(&format!("person/{}", person_id));
        let request = match change {
            PersonChange::Add { name } => self.client.post(url).json(&AddBody { name }),
            PersonChange::Edit { id, name } => self.client.patch(url).json(&EditBody { id, name }),
        };

        let count = request
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json::<PersonCount>()
            .await?;
        Ok(count.persons)
    }

    async fn delete_person(&self, access_token: &str, person_id: &str) -> Result<usize> {
        let count = self
            .client
            .delete(self.url(&format!("person/{}", person_id)))
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json::<PersonCount>()
            .await?;
        Ok(count.persons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_always_ends_with_slash() {
        assert_eq!(normalize_base_url("https://face.iobroker.in"), "https://face.iobroker.in/");
        assert_eq!(normalize_base_url("https://face.iobroker.in/"), "https://face.iobroker.in/");
    }

    #[test]
    fn endpoints_are_relative_to_base() {
        let service = HttpFaceService::new(&ServiceConfig {
            base_url: "http://localhost:8080/api".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(service.url("persons"), "http://localhost:8080/api/persons");
    }

    #[test]
    fn person_count_tolerates_missing_field() {
        let count: PersonCount = serde_json::from_str(r#"{"persons":3}"#).unwrap();
        assert_eq!(count.persons, 3);
        let empty: PersonCount = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.persons, 0);
    }
}
