use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::{FaceLinkError, Result};
use crate::core::token::{fingerprint, is_token_valid_at, token_expiry, TokenPair};
use crate::service::face_api::FaceService;
use crate::storage::CredentialStore;

#[derive(Default)]
struct TokenState {
    access: Option<String>,
    refresh: Option<String>,
}

impl TokenState {
    fn adopt(&mut self, pair: &TokenPair) {
        self.access = non_empty(&pair.access_token);
        self.refresh = non_empty(&pair.refresh_token);
    }

    fn clear(&mut self) {
        self.access = None;
        self.refresh = None;
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Keeps an access token valid for one process.
///
/// Both the interactive side and the agent run their own manager over the
/// same credential slot. Whoever refreshes or logs in writes the complete
/// pair back, and the other side picks it up through the store's change
/// feed (see [`TokenManager::spawn_store_watch`]).
pub struct TokenManager {
    service: Arc<dyn FaceService>,
    store: Arc<dyn CredentialStore>,
    key: String,
    credentials: Option<(String, String)>,
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(
        service: Arc<dyn FaceService>,
        store: Arc<dyn CredentialStore>,
        key: impl Into<String>,
        credentials: Option<(String, String)>,
    ) -> Self {
        Self {
            service,
            store,
            key: key.into(),
            credentials,
            state: Mutex::new(TokenState::default()),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Returns an access token whose `exp` lies in the future, refreshing or
    /// logging in when needed. Concurrent callers queue behind one another.
    pub async fn ensure_valid_access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;

        if state.access.is_none() {
            self.reload_from_store(&mut state);
        }

        let now = chrono::Utc::now().timestamp();

        if let Some(access) = &state.access {
            if is_token_valid_at(access, now) {
                return Ok(access.clone());
            }
            tracing::debug!("Access token {} expired", fingerprint(access));
        }

        if let Some(refresh) = state.refresh.clone() {
            if is_token_valid_at(&refresh, now) {
                match self.service.refresh_token(&refresh).await {
                    Ok(pair) if pair.is_complete() => {
                        tracing::info!("Access token refreshed ({})", fingerprint(&pair.access_token));
                        return Ok(self.commit(&mut state, pair));
                    }
                    Ok(_) => tracing::warn!("Refresh response lacked a token, falling back to login"),
                    Err(e) => tracing::warn!("Cannot refresh access token: {}", e),
                }
            }
        }

        let Some((login, password)) = &self.credentials else {
            tracing::error!("Cannot authenticate: no login or password defined");
            state.clear();
            return Err(FaceLinkError::Auth("no credentials configured".into()));
        };

        match self.service.token(login, password).await {
            Ok(pair) if pair.is_complete() => {
                tracing::info!("Logged in as {} ({})", login, fingerprint(&pair.access_token));
                Ok(self.commit(&mut state, pair))
            }
            result => {
                match result {
                    Err(e) => tracing::error!("Cannot authenticate: {}", e),
                    Ok(_) => tracing::error!("Cannot authenticate: login response lacked a token"),
                }
                state.clear();
                if let Err(e) = self.store.set(&self.key, "", true) {
                    tracing::warn!("Cannot clear stored tokens: {}", e);
                }
                Err(FaceLinkError::Auth("authentication failed".into()))
            }
        }
    }

    fn reload_from_store(&self, state: &mut TokenState) {
        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Cannot read stored tokens: {}", e);
                return;
            }
        };

        match TokenPair::parse(&raw) {
            Ok(Some(pair)) => {
                state.adopt(&pair);
                if let Some(access) = &state.access {
                    tracing::debug!("Adopted stored access token {}", fingerprint(access));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring stored tokens: {}", e),
        }
    }

    /// Memory first, then the shared slot. A failed write is logged; the
    /// fresh token is still usable by this process.
    fn commit(&self, state: &mut TokenState, pair: TokenPair) -> String {
        state.adopt(&pair);
        if let Err(e) = self.store.set(&self.key, &pair.to_json(), true) {
            tracing::warn!("Cannot persist tokens: {}", e);
        }
        pair.access_token
    }

    /// Handles a change of the shared slot. Anything but a parseable pair
    /// clears the in-memory tokens.
    pub async fn apply_store_value(&self, value: Option<&str>) {
        let mut state = self.state.lock().await;
        match value.map(TokenPair::parse) {
            Some(Ok(Some(pair))) => state.adopt(&pair),
            Some(Err(e)) => {
                tracing::warn!("Stored tokens changed to an unreadable value: {}", e);
                state.clear();
            }
            _ => state.clear(),
        }
    }

    /// Follows the shared slot until `cancel` fires.
    pub fn spawn_store_watch(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut subscription = self.store.subscribe(&self.key);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = subscription.changed() => match change {
                        Some(change) => manager.apply_store_value(change.value.as_deref()).await,
                        None => break,
                    },
                }
            }
        })
    }

    /// Drops the tokens from memory and empties the shared slot.
    pub async fn discard(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.clear();
        self.store.set(&self.key, "", true)
    }

    pub async fn access_token_expiry(&self) -> Option<i64> {
        let state = self.state.lock().await;
        state.access.as_deref().and_then(token_expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::token::test_token;
    use crate::service::face_api::{
        Engine, EnrollOutcome, PersonChange, PersonList, VerifyOutcome,
    };
    use crate::storage::MemoryCredentialStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &str = "info.tokens";

    #[derive(Default, Clone, Copy)]
    enum RefreshReply {
        #[default]
        Fresh,
        Failure,
        MissingRefresh,
    }

    #[derive(Default)]
    struct CountingService {
        logins: AtomicUsize,
        refreshes: AtomicUsize,
        fail_login: bool,
        refresh: RefreshReply,
    }

    fn fresh_pair(tag: &str) -> TokenPair {
        let exp = chrono::Utc::now().timestamp() + 3600;
        TokenPair::new(test_token(&format!("{}-access", tag), exp), test_token(&format!("{}-refresh", tag), exp + 3600))
    }

    #[async_trait]
    impl FaceService for CountingService {
        async fn token(&self, _login: &str, _password: &str) -> Result<TokenPair> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.fail_login {
                Err(FaceLinkError::Auth("bad password".into()))
            } else {
                Ok(fresh_pair("login"))
            }
        }

        async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenPair> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            match self.refresh {
                RefreshReply::Fresh => Ok(fresh_pair("refresh")),
                RefreshReply::Failure => Err(FaceLinkError::Network("connection reset".into())),
                RefreshReply::MissingRefresh => {
                    let pair = fresh_pair("refresh");
                    Ok(TokenPair::new(pair.access_token, String::new()))
                }
            }
        }

        async fn list_persons(&self, _: &str) -> Result<PersonList> {
            Ok(PersonList::default())
        }

        async fn enroll(&self, _: &str, _: Engine, _: &[String], _: &str) -> Result<EnrollOutcome> {
            Ok(EnrollOutcome::default())
        }

        async fn verify(&self, _: &str, _: Engine, _: &[String], _: Option<&str>) -> Result<VerifyOutcome> {
            Ok(VerifyOutcome::default())
        }

        async fn add_or_edit_person(&self, _: &str, _: &str, _: &PersonChange) -> Result<usize> {
            Ok(0)
        }

        async fn delete_person(&self, _: &str, _: &str) -> Result<usize> {
            Ok(0)
        }
    }

    fn creds() -> Option<(String, String)> {
        Some(("user@example.com".into(), "secret".into()))
    }

    #[tokio::test]
    async fn valid_stored_token_needs_no_network() {
        let pair = fresh_pair("stored");
        let service = Arc::new(CountingService::default());
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, &pair.to_json()));
        let manager = TokenManager::new(service.clone(), store.clone(), KEY, creds());

        assert_eq!(manager.ensure_valid_access_token().await.unwrap(), pair.access_token);
        assert_eq!(service.logins.load(Ordering::SeqCst), 0);
        assert_eq!(service.refreshes.load(Ordering::SeqCst), 0);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn expired_refresh_goes_straight_to_login() {
        let now = chrono::Utc::now().timestamp();
        let stale = TokenPair::new(test_token("a", now - 10), test_token("r", now - 5));
        let service = Arc::new(CountingService::default());
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, &stale.to_json()));
        let manager = TokenManager::new(service.clone(), store.clone(), KEY, creds());

        let token = manager.ensure_valid_access_token().await.unwrap();
        assert!(is_token_valid_at(&token, now));
        assert_eq!(service.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(service.logins.load(Ordering::SeqCst), 1);
    }

    fn expired_access_slot() -> MemoryCredentialStore {
        let now = chrono::Utc::now().timestamp();
        let stored = TokenPair::new(test_token("a", now - 10), test_token("r", now + 3600));
        MemoryCredentialStore::with_value(KEY, &stored.to_json())
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_login() {
        let service = Arc::new(CountingService { refresh: RefreshReply::Failure, ..Default::default() });
        let store = Arc::new(expired_access_slot());
        let manager = TokenManager::new(service.clone(), store.clone(), KEY, creds());

        let token = manager.ensure_valid_access_token().await.unwrap();
        assert_eq!(service.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(service.logins.load(Ordering::SeqCst), 1);

        let persisted = TokenPair::parse(&store.get(KEY).unwrap().unwrap()).unwrap().unwrap();
        assert_eq!(persisted.access_token, token);
        assert!(persisted.is_complete());
    }

    #[tokio::test]
    async fn incomplete_refresh_falls_back_to_login() {
        let service = Arc::new(CountingService { refresh: RefreshReply::MissingRefresh, ..Default::default() });
        let store = Arc::new(expired_access_slot());
        let manager = TokenManager::new(service.clone(), store.clone(), KEY, creds());

        manager.ensure_valid_access_token().await.unwrap();
        assert_eq!(service.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(service.logins.load(Ordering::SeqCst), 1);
        let persisted = TokenPair::parse(&store.get(KEY).unwrap().unwrap()).unwrap().unwrap();
        assert!(persisted.is_complete());
    }

    #[tokio::test]
    async fn failed_refresh_without_credentials_never_logs_in() {
        let service = Arc::new(CountingService { refresh: RefreshReply::Failure, ..Default::default() });
        let store = Arc::new(expired_access_slot());
        let manager = TokenManager::new(service.clone(), store, KEY, None);

        let err = manager.ensure_valid_access_token().await.unwrap_err();
        assert!(matches!(err, FaceLinkError::Auth(ref m) if m == "no credentials configured"));
        assert_eq!(service.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(service.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_login_clears_slot() {
        let service = Arc::new(CountingService { fail_login: true, ..Default::default() });
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = TokenManager::new(service.clone(), store.clone(), KEY, creds());

        let err = manager.ensure_valid_access_token().await.unwrap_err();
        assert!(matches!(err, FaceLinkError::Auth(ref m) if m == "authentication failed"));
        assert_eq!(store.get(KEY).unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_network() {
        let service = Arc::new(CountingService::default());
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = TokenManager::new(service.clone(), store, KEY, None);

        let err = manager.ensure_valid_access_token().await.unwrap_err();
        assert!(matches!(err, FaceLinkError::Auth(ref m) if m == "no credentials configured"));
        assert_eq!(service.logins.load(Ordering::SeqCst), 0);
        assert_eq!(service.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_slot_is_treated_as_empty() {
        let service = Arc::new(CountingService::default());
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "{oops"));
        let manager = TokenManager::new(service.clone(), store, KEY, creds());

        manager.ensure_valid_access_token().await.unwrap();
        assert_eq!(service.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_changes_replace_or_clear_memory() {
        let service = Arc::new(CountingService::default());
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = TokenManager::new(service.clone(), store, KEY, None);

        let pair = fresh_pair("other-process");
        manager.apply_store_value(Some(&pair.to_json())).await;
        assert_eq!(manager.ensure_valid_access_token().await.unwrap(), pair.access_token);
        assert!(manager.access_token_expiry().await.is_some());

        manager.apply_store_value(Some("not json")).await;
        assert_eq!(manager.access_token_expiry().await, None);
    }
}
