use std::sync::Arc;

use reqwest::Client;
use tracing::{debug, instrument, warn};

use crate::config::{endpoints, AuthConfig, SESSION_STORAGE_KEY};
use crate::errors::{AuthError, Result};
use crate::models::{
    MfaRequirement, MfaVerifyRequest, OneTimeCodeRequest, RefreshTokenRequest,
    StoredIdentitySession, TokenPair, UserInfo,
};
use crate::storage::SessionStorage;

/// Identity-backend client
///
/// The seam other components depend on. Every session the client produces is
/// persisted through [`SessionStorage`] so that token rotation survives
/// process restarts.
#[async_trait::async_trait]
pub trait IdentityClient: Send + Sync {
    /// Restore whatever session the storage holds
    async fn initialize(&self) -> Result<()>;

    /// Current session, refreshed transparently when it has expired
    async fn get_session(&self) -> Result<Option<StoredIdentitySession>>;

    /// User behind the current session
    async fn get_user(&self) -> Result<Option<UserInfo>>;

    /// Explicitly rotate the session; `None` when there is nothing to refresh
    async fn refresh_session(&self) -> Result<Option<StoredIdentitySession>>;

    /// Remote sign-out; the local session record is removed unconditionally
    async fn sign_out(&self) -> Result<()>;

    /// Persist a freshly issued token pair as the current session
    async fn adopt_session(&self, tokens: TokenPair) -> Result<StoredIdentitySession>;

    /// Exchange a one-time code for a session
    async fn verify_one_time_code(&self, code: &str) -> Result<StoredIdentitySession>;

    /// Pending multi-factor requirement for the current session
    async fn check_mfa_required(&self) -> Result<MfaRequirement>;

    /// Complete a pending multi-factor challenge
    async fn verify_mfa(&self, factor_id: &str, code: &str) -> Result<StoredIdentitySession>;
}

/// HTTP implementation of the identity backend
#[derive(Clone)]
pub struct HttpIdentityClient {
    http: Client,
    config: AuthConfig,
    storage: Arc<dyn SessionStorage>,
}

impl std::fmt::Debug for HttpIdentityClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpIdentityClient {
    pub fn new(config: AuthConfig, storage: Arc<dyn SessionStorage>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or("codeflow"))
            .build()?;

        Ok(Self {
            http,
            config,
            storage,
        })
    }

    async fn load_stored(&self) -> Option<StoredIdentitySession> {
        let raw = self.storage.get(SESSION_STORAGE_KEY).await?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Stored session record is unreadable ({}); ignoring it", e);
                None
            }
        }
    }

    /// Replace the stored session record as one value, never a field merge
    async fn persist_session(&self, session: &StoredIdentitySession) -> Result<()> {
        if session.access_token.is_empty()
            && session.refresh_token.as_deref().is_none_or(str::is_empty)
        {
            return Err(AuthError::Storage(
                "Refusing to overwrite session with an empty token pair".to_string(),
            ));
        }
        if session.user.id.is_empty() {
            return Err(AuthError::Storage(
                "Refusing to persist session without a user id".to_string(),
            ));
        }

        let json = serde_json::to_string(session)?;
        self.storage.set(SESSION_STORAGE_KEY, &json).await
    }

    async fn fetch_user(&self, access_token: &str) -> Result<UserInfo> {
        let url = self.config.endpoint(endpoints::USER)?;
        let response = self
            .http
            .get(url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        Ok(response.json().await?)
    }

    async fn token_grant<B: serde::Serialize>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<TokenPair> {
        let mut url = self.config.endpoint(endpoints::TOKEN)?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);

        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn initialize(&self) -> Result<()> {
        let restored = self.load_stored().await.is_some();
        debug!(restored, "Identity client initialized");
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<StoredIdentitySession>> {
        let Some(session) = self.load_stored().await else {
            return Ok(None);
        };

        if !session.is_expired() {
            return Ok(Some(session));
        }

        if session.refresh_token.is_none() {
            debug!("Session expired with no refresh token; treating as signed out");
            return Ok(None);
        }

        match self.refresh_session().await {
            Ok(refreshed) => Ok(refreshed),
            Err(e) => {
                warn!("Background session refresh failed: {}", e);
                Ok(None)
            }
        }
    }

    async fn get_user(&self) -> Result<Option<UserInfo>> {
        let Some(session) = self.get_session().await? else {
            return Ok(None);
        };
        Ok(Some(self.fetch_user(&session.access_token).await?))
    }

    #[instrument(skip(self))]
    async fn refresh_session(&self) -> Result<Option<StoredIdentitySession>> {
        let Some(stored) = self.load_stored().await else {
            return Ok(None);
        };
        let Some(refresh_token) = stored.refresh_token.clone() else {
            return Ok(None);
        };

        debug!("Refreshing session");
        let tokens = self
            .token_grant("refresh_token", &RefreshTokenRequest { refresh_token })
            .await?;

        let user = tokens.user.clone().unwrap_or(stored.user);
        let session = StoredIdentitySession::from_tokens(tokens, user);

        // The old refresh token died the moment the new one was issued; the
        // replacement must land on disk before this call returns.
        self.persist_session(&session).await?;

        Ok(Some(session))
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<()> {
        let stored = self.load_stored().await;

        // Local sign-out happens regardless of what the backend says next.
        if let Err(e) = self.storage.remove(SESSION_STORAGE_KEY).await {
            warn!("Could not remove stored session: {}", e);
        }

        let Some(stored) = stored else {
            return Ok(());
        };

        let url = self.config.endpoint(endpoints::LOGOUT)?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(&stored.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        Ok(())
    }

    #[instrument(skip(self, tokens))]
    async fn adopt_session(&self, tokens: TokenPair) -> Result<StoredIdentitySession> {
        let user = match tokens.user.clone() {
            Some(user) => user,
            None => self.fetch_user(&tokens.access_token).await?,
        };

        let session = StoredIdentitySession::from_tokens(tokens, user);
        self.persist_session(&session).await?;
        Ok(session)
    }

    #[instrument(skip(self, code))]
    async fn verify_one_time_code(&self, code: &str) -> Result<StoredIdentitySession> {
        let tokens = self
            .token_grant(
                "one_time_code",
                &OneTimeCodeRequest {
                    code: code.to_string(),
                },
            )
            .await?;
        self.adopt_session(tokens).await
    }

    async fn check_mfa_required(&self) -> Result<MfaRequirement> {
        let Some(session) = self.load_stored().await else {
            return Ok(MfaRequirement::default());
        };

        let url = self.config.endpoint(endpoints::MFA_REQUIREMENT)?;
        let response = self
            .http
            .get(url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        Ok(response.json().await?)
    }

    #[instrument(skip(self, code))]
    async fn verify_mfa(&self, factor_id: &str, code: &str) -> Result<StoredIdentitySession> {
        let url = self.config.endpoint(endpoints::MFA_VERIFY)?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.api_key)
            .json(&MfaVerifyRequest {
                factor_id: factor_id.to_string(),
                code: code.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        let tokens: TokenPair = response.json().await?;
        self.adopt_session(tokens).await
    }
}

/// Map a non-success response to an error with a short body snippet
pub(crate) async fn http_error(response: reqwest::Response) -> AuthError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    AuthError::Http {
        status,
        body_snippet: body.chars().take(200).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientMetadata;
    use crate::storage::MemorySessionStore;
    use chrono::Utc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> AuthConfig {
        let mut config = AuthConfig::new(
            "test-api-key",
            ClientMetadata::detect("codeflow-test", "0.0.0"),
        )
        .unwrap();
        config.base_url = url::Url::parse(base_url).unwrap();
        config
    }

    fn stored_session(refresh_token: Option<&str>, expired: bool) -> StoredIdentitySession {
        let offset = if expired { -60 } else { 3600 };
        StoredIdentitySession {
            access_token: "old-access".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            token_type: "bearer".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(offset),
            user: UserInfo {
                id: "user-1".to_string(),
                email: Some("user@example.com".to_string()),
            },
            saved_at: Utc::now(),
        }
    }

    async fn client_with_session(
        base_url: &str,
        session: Option<StoredIdentitySession>,
    ) -> (HttpIdentityClient, Arc<MemorySessionStore>) {
        let storage = Arc::new(MemorySessionStore::new());
        if let Some(session) = session {
            storage
                .set(
                    SESSION_STORAGE_KEY,
                    &serde_json::to_string(&session).unwrap(),
                )
                .await
                .unwrap();
        }
        let client = HttpIdentityClient::new(test_config(base_url), storage.clone()).unwrap();
        (client, storage)
    }

    #[tokio::test]
    async fn refresh_rotates_the_stored_record_before_returning() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600,
                "token_type": "bearer",
                "user": {"id": "user-1", "email": "user@example.com"}
            })))
            .mount(&server)
            .await;

        let (client, storage) =
            client_with_session(&server.uri(), Some(stored_session(Some("old-refresh"), false)))
                .await;

        let refreshed = client.refresh_session().await.unwrap().unwrap();
        assert_eq!(refreshed.access_token, "new-access");

        // The bridge already holds the rotated record
        let raw = storage.get(SESSION_STORAGE_KEY).await.unwrap();
        let persisted: StoredIdentitySession = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.refresh_token.as_deref(), Some("new-refresh"));
    }

    #[tokio::test]
    async fn refresh_without_a_session_is_none() {
        let server = MockServer::start().await;
        let (client, _storage) = client_with_session(&server.uri(), None).await;
        assert!(client.refresh_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_session_refreshes_an_expired_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600,
                "user": {"id": "user-1"}
            })))
            .mount(&server)
            .await;

        let (client, _storage) =
            client_with_session(&server.uri(), Some(stored_session(Some("old-refresh"), true)))
                .await;

        let session = client.get_session().await.unwrap().unwrap();
        assert_eq!(session.access_token, "new-access");
    }

    #[tokio::test]
    async fn get_session_degrades_when_refresh_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (client, _storage) =
            client_with_session(&server.uri(), Some(stored_session(Some("old-refresh"), true)))
                .await;

        assert!(client.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sign_out_clears_locally_even_when_backend_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (client, storage) =
            client_with_session(&server.uri(), Some(stored_session(Some("refresh"), false)))
                .await;

        let result = client.sign_out().await;
        assert!(result.is_err());
        assert!(storage.get(SESSION_STORAGE_KEY).await.is_none());
    }

    #[tokio::test]
    async fn one_time_code_exchange_adopts_the_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "one_time_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "code-access",
                "refresh_token": "code-refresh",
                "expires_in": 3600,
                "user": {"id": "user-2", "email": "two@example.com"}
            })))
            .mount(&server)
            .await;

        let (client, storage) = client_with_session(&server.uri(), None).await;

        let session = client.verify_one_time_code("the-code").await.unwrap();
        assert_eq!(session.user.id, "user-2");
        assert!(storage.get(SESSION_STORAGE_KEY).await.is_some());
    }

    #[tokio::test]
    async fn adopt_session_fetches_the_user_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "user-3",
                "email": "three@example.com"
            })))
            .mount(&server)
            .await;

        let (client, _storage) = client_with_session(&server.uri(), None).await;

        let session = client
            .adopt_session(TokenPair {
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_in: Some(3600),
                token_type: None,
                user: None,
            })
            .await
            .unwrap();

        assert_eq!(session.user.id, "user-3");
    }

    #[tokio::test]
    async fn adopt_refuses_an_empty_token_pair() {
        let server = MockServer::start().await;
        let (client, storage) = client_with_session(&server.uri(), None).await;

        let result = client
            .adopt_session(TokenPair {
                access_token: String::new(),
                refresh_token: None,
                expires_in: None,
                token_type: None,
                user: Some(UserInfo {
                    id: "user-1".to_string(),
                    email: None,
                }),
            })
            .await;

        assert!(matches!(result, Err(AuthError::Storage(_))));
        assert!(storage.get(SESSION_STORAGE_KEY).await.is_none());
    }

    #[tokio::test]
    async fn get_user_resolves_through_the_current_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "user-1",
                "email": "user@example.com"
            })))
            .mount(&server)
            .await;

        let (client, _storage) =
            client_with_session(&server.uri(), Some(stored_session(Some("refresh"), false)))
                .await;

        let user = client.get_user().await.unwrap().unwrap();
        assert_eq!(user.id, "user-1");

        let (signed_out, _storage) = client_with_session(&server.uri(), None).await;
        assert!(signed_out.get_user().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mfa_requirement_without_a_session_is_unrequired() {
        let server = MockServer::start().await;
        let (client, _storage) = client_with_session(&server.uri(), None).await;

        let requirement = client.check_mfa_required().await.unwrap();
        assert!(!requirement.required);
    }

    #[tokio::test]
    async fn mfa_requirement_is_fetched_for_a_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/mfa/requirement"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "required": true,
                "factor_id": "factor-1",
                "factor_type": "totp"
            })))
            .mount(&server)
            .await;

        let (client, _storage) =
            client_with_session(&server.uri(), Some(stored_session(Some("refresh"), false)))
                .await;

        let requirement = client.check_mfa_required().await.unwrap();
        assert!(requirement.required);
        assert_eq!(requirement.factor_id.as_deref(), Some("factor-1"));
    }
}
