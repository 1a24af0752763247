use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use crate::config::AuthConfig;
use crate::context::ContextStore;
use crate::errors::{AuthError, Result};
use crate::flow::{AuthOptions, OAuthService};
use crate::identity::{HttpIdentityClient, IdentityClient};
use crate::models::{AuthCredentials, StoredIdentitySession};
use crate::storage::{FileSessionStore, SessionStorage};

/// The stable facade the rest of the CLI depends on
///
/// Construction wires the durable stores; the first public call runs a single
/// shared initialization (backend session restore plus one-time legacy
/// migration), and every public method awaits it before touching session
/// state.
pub struct SessionManager {
    identity: Arc<dyn IdentityClient>,
    oauth: OAuthService,
    context: ContextStore,
    legacy_credentials_path: PathBuf,
    init: OnceCell<()>,
}

impl SessionManager {
    /// Wire a manager against the configured backend and data directory
    pub async fn new(config: AuthConfig) -> Result<Self> {
        let storage: Arc<dyn SessionStorage> =
            Arc::new(FileSessionStore::new(config.session_store_path()).await?);
        let identity: Arc<dyn IdentityClient> =
            Arc::new(HttpIdentityClient::new(config.clone(), storage)?);
        let context = ContextStore::new(config.context_path());
        let legacy_credentials_path = config.legacy_credentials_path();
        let oauth = OAuthService::new(config, identity.clone(), context.clone())?;

        Ok(Self::with_components(
            identity,
            oauth,
            context,
            legacy_credentials_path,
        ))
    }

    /// Assemble a manager from explicit components
    ///
    /// Components are passed in rather than reached through globals so tests
    /// can run isolated instances side by side.
    pub fn with_components(
        identity: Arc<dyn IdentityClient>,
        oauth: OAuthService,
        context: ContextStore,
        legacy_credentials_path: PathBuf,
    ) -> Self {
        Self {
            identity,
            oauth,
            context,
            legacy_credentials_path,
            init: OnceCell::new(),
        }
    }

    async fn ensure_initialized(&self) {
        self.init.get_or_init(|| self.initialize()).await;
    }

    async fn initialize(&self) {
        if let Err(e) = self.identity.initialize().await {
            warn!("Session restore failed during startup: {}", e);
        }
        self.migrate_legacy_credentials().await;
    }

    /// One-time migration away from the legacy single-file credential store
    ///
    /// The legacy file is deleted only once a session is resolvable through
    /// the new store; otherwise it stays, since it may be the only remaining
    /// credential.
    async fn migrate_legacy_credentials(&self) {
        if !self.legacy_credentials_path.exists() {
            return;
        }

        match self.identity.get_session().await {
            Ok(Some(_)) => match tokio::fs::remove_file(&self.legacy_credentials_path).await {
                Ok(()) => info!(
                    "Migrated legacy credential file {}",
                    self.legacy_credentials_path.display()
                ),
                Err(e) => warn!(
                    "Could not remove legacy credential file {}: {}",
                    self.legacy_credentials_path.display(),
                    e
                ),
            },
            _ => warn!(
                "Legacy credential file {} present but no session restored; leaving it in place",
                self.legacy_credentials_path.display()
            ),
        }
    }

    /// Whether a usable session exists; errors read as "not logged in"
    pub async fn has_valid_session(&self) -> bool {
        self.ensure_initialized().await;
        matches!(self.identity.get_session().await, Ok(Some(_)))
    }

    /// Current access token, if any
    pub async fn access_token(&self) -> Option<String> {
        self.ensure_initialized().await;
        self.identity
            .get_session()
            .await
            .ok()
            .flatten()
            .map(|session| session.access_token)
    }

    /// Current credentials plus the locally stored non-auth context
    pub async fn auth_credentials(&self) -> Option<AuthCredentials> {
        self.ensure_initialized().await;
        let session = self.identity.get_session().await.ok().flatten()?;
        Some(self.assemble(&session).await)
    }

    /// Run a fresh browser login attempt
    pub async fn authenticate(&self, options: &AuthOptions) -> Result<AuthCredentials> {
        self.ensure_initialized().await;
        self.oauth.authenticate(options).await
    }

    /// Exchange a one-time code, then apply the same MFA gate as a browser login
    #[instrument(skip(self, code))]
    pub async fn authenticate_with_code(&self, code: &str) -> Result<AuthCredentials> {
        self.ensure_initialized().await;

        let session = self.identity.verify_one_time_code(code).await?;
        self.persist_identity(&session).await;

        let requirement = self.identity.check_mfa_required().await?;
        if let Some(gate) = requirement.into_gate() {
            return Err(gate);
        }

        Ok(self.assemble(&session).await)
    }

    /// Complete a pending multi-factor challenge
    #[instrument(skip(self, code))]
    pub async fn verify_mfa(&self, factor_id: &str, code: &str) -> Result<AuthCredentials> {
        self.ensure_initialized().await;

        let session = self.identity.verify_mfa(factor_id, code).await?;
        self.persist_identity(&session).await;

        Ok(self.assemble(&session).await)
    }

    /// Explicitly rotate the session
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<AuthCredentials> {
        self.ensure_initialized().await;

        let session = match self.identity.refresh_session().await {
            Ok(Some(session)) => session,
            Ok(None) => return Err(AuthError::RefreshFailed),
            Err(e) => {
                warn!("Session refresh failed: {}", e);
                return Err(AuthError::RefreshFailed);
            }
        };

        self.persist_identity(&session).await;
        Ok(self.assemble(&session).await)
    }

    /// Sign out
    ///
    /// The remote call is best-effort; local state is cleared no matter what
    /// the backend says.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        self.ensure_initialized().await;

        if let Err(e) = self.identity.sign_out().await {
            warn!("Remote sign-out failed: {}", e);
        }

        if let Err(e) = self.context.clear_identity().await {
            warn!("Could not clear user context: {}", e);
        }

        if self.legacy_credentials_path.exists() {
            if let Err(e) = tokio::fs::remove_file(&self.legacy_credentials_path).await {
                warn!(
                    "Could not remove legacy credential file {}: {}",
                    self.legacy_credentials_path.display(),
                    e
                );
            }
        }
    }

    async fn persist_identity(&self, session: &StoredIdentitySession) {
        if let Err(e) = self
            .context
            .save_identity(&session.user.id, session.user.email.as_deref())
            .await
        {
            warn!("Could not persist user context: {}", e);
        }
    }

    async fn assemble(&self, session: &StoredIdentitySession) -> AuthCredentials {
        let selected_context = self.context.load().await.and_then(|c| c.selected_context);
        AuthCredentials::assemble(session, selected_context)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("legacy_credentials_path", &self.legacy_credentials_path)
            .field("initialized", &self.init.initialized())
            .finish_non_exhaustive()
    }
}
