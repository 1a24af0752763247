use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use crate::config::{endpoints, AuthConfig};
use crate::context::ContextStore;
use crate::crypto::{self, FlowKeyPair};
use crate::errors::{AuthError, Result};
use crate::identity::{http_error, IdentityClient};
use crate::models::{
    AuthCredentials, EncryptedTokenPayload, FlowState, FlowStatus, FlowStatusResponse,
    StartFlowRequest, StartFlowResponse, TokenPair,
};

/// Best-effort browser launcher collaborator
pub type BrowserLauncher = Box<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

fn default_browser_launcher() -> BrowserLauncher {
    Box::new(|url| {
        open::that(url)?;
        Ok(())
    })
}

/// Clock/sleep seam so tests can drive the polling loop without real timers
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by tokio timers
#[derive(Debug, Default)]
pub struct TokioClock;

#[async_trait::async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Callbacks the CLI layer consumes during a login attempt
#[derive(Default)]
pub struct AuthEvents {
    pub on_auth_url: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_waiting: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_success: Option<Box<dyn Fn(&AuthCredentials) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&AuthError) + Send + Sync>>,
}

impl AuthEvents {
    fn auth_url(&self, url: &str) {
        if let Some(notify) = &self.on_auth_url {
            notify(url);
        }
    }

    fn waiting(&self) {
        if let Some(notify) = &self.on_waiting {
            notify();
        }
    }

    fn success(&self, credentials: &AuthCredentials) {
        if let Some(notify) = &self.on_success {
            notify(credentials);
        }
    }

    /// The MFA continuation signals "verify the second factor next", not a
    /// failed login, and never reaches `on_error`.
    fn error(&self, error: &AuthError) {
        if error.is_mfa_continuation() {
            return;
        }
        if let Some(notify) = &self.on_error {
            notify(error);
        }
    }
}

impl std::fmt::Debug for AuthEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthEvents")
            .field("on_auth_url", &self.on_auth_url.is_some())
            .field("on_waiting", &self.on_waiting.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Options for one login attempt
#[derive(Debug)]
pub struct AuthOptions {
    /// Overall wall-clock bound; the configured default when unset
    pub timeout: Option<Duration>,
    /// Whether to launch a browser at the verification URL
    pub launch_browser: bool,
    pub events: AuthEvents,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            launch_browser: true,
            events: AuthEvents::default(),
        }
    }
}

/// Everything belonging to one attempt: the keypair plus the server-issued
/// flow state
///
/// Threaded through start/poll/decrypt as a value so a second attempt can
/// never observe the first attempt's keys. Dropped at attempt end, success or
/// failure.
#[derive(Debug)]
struct FlowAttempt {
    keys: FlowKeyPair,
    flow: FlowState,
}

/// What one classified poll response means for the loop
#[derive(Debug)]
enum PollVerdict {
    /// Keep waiting (pending/authenticating, or an unintelligible response)
    Wait,
    /// Flow complete; decrypt this payload
    Tokens(EncryptedTokenPayload),
}

/// Drives one browser login attempt end to end
pub struct OAuthService {
    http: Client,
    config: AuthConfig,
    identity: Arc<dyn IdentityClient>,
    context: ContextStore,
    clock: Arc<dyn Clock>,
    browser: BrowserLauncher,
}

impl OAuthService {
    pub fn new(
        config: AuthConfig,
        identity: Arc<dyn IdentityClient>,
        context: ContextStore,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or("codeflow"))
            .build()?;

        Ok(Self {
            http,
            config,
            identity,
            context,
            clock: Arc::new(TokioClock),
            browser: default_browser_launcher(),
        })
    }

    /// Replace the clock seam (tests)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the browser launcher collaborator
    pub fn with_browser_launcher(mut self, browser: BrowserLauncher) -> Self {
        self.browser = browser;
        self
    }

    /// Run one authentication attempt
    ///
    /// Success and failure are mirrored to the attempt's callbacks; the MFA
    /// continuation is surfaced only as [`AuthError::MfaRequired`].
    pub async fn authenticate(&self, options: &AuthOptions) -> Result<AuthCredentials> {
        let result = self.run_attempt(options).await;
        match &result {
            Ok(credentials) => options.events.success(credentials),
            Err(error) => options.events.error(error),
        }
        result
    }

    async fn run_attempt(&self, options: &AuthOptions) -> Result<AuthCredentials> {
        // A fresh keypair per attempt; never shared, never persisted.
        let keys = FlowKeyPair::generate();
        let flow = self.start_flow(&keys.public_key_base64()).await?;
        let attempt = FlowAttempt { keys, flow };

        options.events.auth_url(&attempt.flow.verification_url);

        if options.launch_browser {
            if let Err(e) = (self.browser)(&attempt.flow.verification_url) {
                warn!("Could not open a browser automatically: {}", e);
            }
        }

        options.events.waiting();

        let timeout = options.timeout.unwrap_or(self.config.flow_timeout);
        let tokens = self.poll_for_completion(&attempt, timeout).await?;

        if tokens.refresh_token.is_none() {
            warn!("Backend returned no refresh token; this session cannot be refreshed later");
        }

        let session = self.identity.adopt_session(tokens).await?;

        if let Err(e) = self
            .context
            .save_identity(&session.user.id, session.user.email.as_deref())
            .await
        {
            warn!("Could not persist user context: {}", e);
        }

        let requirement = self.identity.check_mfa_required().await?;
        if let Some(gate) = requirement.into_gate() {
            return Err(gate);
        }

        let selected_context = self.context.load().await.and_then(|c| c.selected_context);
        Ok(AuthCredentials::assemble(&session, selected_context))
    }

    #[instrument(skip(self, public_key))]
    async fn start_flow(&self, public_key: &str) -> Result<FlowState> {
        let url = self.config.endpoint(endpoints::FLOW_START)?;
        let request = StartFlowRequest {
            name: self.config.client.name.clone(),
            version: self.config.client.version.clone(),
            device: self.config.client.device.clone(),
            user: self.config.client.user.clone(),
            platform: self.config.client.platform.clone(),
            public_key: public_key.to_string(),
        };

        debug!("Starting login flow");
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(AuthError::BackendUnreachable)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::StartFlowFailed {
                message: format!("{}: {}", status, body.chars().take(200).collect::<String>()),
            });
        }

        let started: StartFlowResponse =
            response.json().await.map_err(|e| AuthError::StartFlowFailed {
                message: format!("unreadable response: {}", e),
            })?;

        if !started.success {
            return Err(AuthError::StartFlowFailed {
                message: started
                    .message
                    .unwrap_or_else(|| "backend reported failure".to_string()),
            });
        }

        let (Some(flow_id), Some(verification_url)) = (started.flow_id, started.verification_url)
        else {
            return Err(AuthError::StartFlowFailed {
                message: "response missing flow id or verification URL".to_string(),
            });
        };

        Ok(FlowState {
            flow_id,
            verification_url,
            expires_at: started.expires_at,
            poll_interval: started
                .poll_interval
                .map(Duration::from_secs)
                .unwrap_or(self.config.default_poll_interval),
        })
    }

    /// Poll the flow until a terminal state or the wall-clock timeout
    ///
    /// Fixed think-time between attempts; transient failures are retried on
    /// the next tick, and only protocol-level responses or the timeout
    /// terminate the loop.
    async fn poll_for_completion(&self, attempt: &FlowAttempt, timeout: Duration) -> Result<TokenPair> {
        let deadline = self.clock.now() + timeout;
        let interval = attempt.flow.poll_interval;

        loop {
            if self.clock.now() >= deadline {
                return Err(AuthError::Timeout { waited: timeout });
            }

            match self.fetch_status(&attempt.flow.flow_id).await {
                Ok(response) => match classify_status(response)? {
                    PollVerdict::Wait => {}
                    PollVerdict::Tokens(payload) => {
                        return crypto::open_tokens(&payload, &attempt.keys, &attempt.flow.flow_id);
                    }
                },
                Err(AuthError::FlowNotFound) => return Err(AuthError::FlowNotFound),
                Err(e) => debug!("Transient poll failure, retrying: {}", e),
            }

            let remaining = deadline.saturating_duration_since(self.clock.now());
            self.clock.sleep(interval.min(remaining)).await;
        }
    }

    async fn fetch_status(&self, flow_id: &str) -> Result<FlowStatusResponse> {
        let mut url = self.config.endpoint(endpoints::FLOW_STATUS)?;
        url.query_pairs_mut().append_pair("flow_id", flow_id);

        let response = self
            .http
            .get(url)
            .header("apikey", &self.config.api_key)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(AuthError::FlowNotFound);
        }

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        Ok(response.json().await?)
    }
}

impl std::fmt::Debug for OAuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Classify one status response into the next loop step
fn classify_status(response: FlowStatusResponse) -> Result<PollVerdict> {
    if !response.success {
        return Err(AuthError::InvalidResponse(
            response
                .error_description
                .or(response.error)
                .unwrap_or_else(|| "status request failed".to_string()),
        ));
    }

    match response.status {
        Some(FlowStatus::Pending) | Some(FlowStatus::Authenticating) => Ok(PollVerdict::Wait),
        Some(FlowStatus::Complete) => match response.encrypted_tokens {
            Some(payload) => Ok(PollVerdict::Tokens(payload)),
            None => Err(AuthError::MissingTokens),
        },
        Some(FlowStatus::Failed) => Err(AuthError::OAuthFailed {
            description: response
                .error_description
                .or(response.error)
                .unwrap_or_else(|| "authentication failed".to_string()),
        }),
        Some(FlowStatus::Expired) => Err(AuthError::FlowExpired),
        None => {
            debug!("Status response carried no status; waiting for the next tick");
            Ok(PollVerdict::Wait)
        }
    }
}
