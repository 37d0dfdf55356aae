#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use homeface::common::{FaceLinkError, Result};
use homeface::core::TokenPair;
use homeface::service::face_api::{
    Engine, EnrollOutcome, FaceService, PersonChange, PersonList, PersonRecord, VerifyOutcome,
};

pub const KEY: &str = "info.tokens";

pub fn token(subject: &str, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}","exp":{}}}"#, subject, exp));
    format!("{}.{}.", header, payload)
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn fresh_pair(tag: &str) -> TokenPair {
    let exp = now() + 3600;
    TokenPair::new(token(&format!("{}-access", tag), exp), token(&format!("{}-refresh", tag), exp + 3600))
}

pub fn creds() -> Option<(String, String)> {
    Some(("user@example.com".into(), "secret".into()))
}

pub fn data_uri(tag: &str) -> String {
    format!("data:image/jpeg;base64,{}", base64::engine::general_purpose::STANDARD.encode(tag))
}

/// Scripted face service that records what it was asked.
#[derive(Default)]
pub struct MockService {
    pub logins: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub persons: Mutex<Vec<PersonRecord>>,
    pub verify_match: Mutex<Option<String>>,
    pub submitted: Mutex<Vec<Vec<String>>>,
}

impl MockService {
    pub fn with_persons(ids: &[&str]) -> Self {
        let service = Self::default();
        *service.persons.lock().unwrap() = ids
            .iter()
            .map(|id| PersonRecord { id: id.to_string(), name: id.to_uppercase(), iobroker: None, advanced: None })
            .collect();
        service
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn check(&self, access_token: &str) -> Result<()> {
        if homeface::core::token::is_token_valid(access_token) {
            Ok(())
        } else {
            Err(FaceLinkError::Auth("expired token".into()))
        }
    }
}

#[async_trait]
impl FaceService for MockService {
    async fn token(&self, _login: &str, _password: &str) -> Result<TokenPair> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(fresh_pair("login"))
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenPair> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(fresh_pair("refresh"))
    }

    async fn list_persons(&self, access_token: &str) -> Result<PersonList> {
        self.check(access_token)?;
        Ok(PersonList { persons: self.persons.lock().unwrap().clone(), stats: None })
    }

    async fn enroll(&self, access_token: &str, _: Engine, images: &[String], _: &str) -> Result<EnrollOutcome> {
        self.check(access_token)?;
        self.submitted.lock().unwrap().push(images.to_vec());
        Ok(EnrollOutcome { enrolled: true, stats: None })
    }

    async fn verify(
        &self,
        access_token: &str,
        _: Engine,
        images: &[String],
        _: Option<&str>,
    ) -> Result<VerifyOutcome> {
        self.check(access_token)?;
        self.submitted.lock().unwrap().push(images.to_vec());
        Ok(VerifyOutcome { person: self.verify_match.lock().unwrap().clone(), ..Default::default() })
    }

    async fn add_or_edit_person(&self, access_token: &str, _: &str, _: &PersonChange) -> Result<usize> {
        self.check(access_token)?;
        Ok(self.persons.lock().unwrap().len())
    }

    async fn delete_person(&self, access_token: &str, _: &str) -> Result<usize> {
        self.check(access_token)?;
        Ok(self.persons.lock().unwrap().len())
    }
}
