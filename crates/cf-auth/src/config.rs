use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::errors::{AuthError, Result};

/// Relative endpoint paths on the backend base URL
pub mod endpoints {
    /// Starts a browser login flow
    pub const FLOW_START: &str = "auth/flow/start";
    /// Polls the state of a browser login flow
    pub const FLOW_STATUS: &str = "auth/flow/status";
    /// Token grants (refresh, one-time code exchange)
    pub const TOKEN: &str = "auth/v1/token";
    /// Authenticated user lookup
    pub const USER: &str = "auth/v1/user";
    /// Remote sign-out
    pub const LOGOUT: &str = "auth/v1/logout";
    /// Pending multi-factor requirement for the current session
    pub const MFA_REQUIREMENT: &str = "auth/v1/mfa/requirement";
    /// Completes a pending multi-factor challenge
    pub const MFA_VERIFY: &str = "auth/v1/mfa/verify";
}

/// Default backend API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.codeflow.dev/";

/// Storage key the session record is bridged under
pub const SESSION_STORAGE_KEY: &str = "codeflow-auth-token";

/// Overall wall-clock bound on one browser login attempt
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(300);

/// Poll interval used when the server does not specify one
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Time skew for token expiration (refresh 30 seconds early)
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// File names under the data directory
pub const SESSION_STORE_FILE: &str = "session.json";
pub const CONTEXT_FILE: &str = "context.json";
pub const LEGACY_CREDENTIALS_FILE: &str = "credentials.json";

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Client metadata sent when starting a login flow
#[derive(Debug, Clone)]
pub struct ClientMetadata {
    /// Client program name (e.g. "codeflow")
    pub name: String,
    /// Client program version
    pub version: String,
    /// Device name, best-effort
    pub device: String,
    /// Local account name, best-effort
    pub user: Option<String>,
    /// Operating system identifier
    pub platform: String,
}

impl ClientMetadata {
    /// Build metadata for this client, detecting device/user/platform from the
    /// environment
    pub fn detect(name: impl Into<String>, version: impl Into<String>) -> Self {
        let device = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok();

        Self {
            name: name.into(),
            version: version.into(),
            device,
            user,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Configuration for the authentication core
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Backend API base URL
    pub base_url: Url,

    /// Publishable API key sent with every backend request
    pub api_key: String,

    /// Client metadata included in the flow-start request
    pub client: ClientMetadata,

    /// HTTP client timeouts
    pub http_timeouts: HttpTimeouts,

    /// Overall wall-clock timeout for one login attempt
    pub flow_timeout: Duration,

    /// Poll interval fallback when the server omits one
    pub default_poll_interval: Duration,

    /// Directory holding the session store, context file and legacy credentials
    pub data_dir: PathBuf,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,
}

impl AuthConfig {
    /// Create a config against the default backend
    pub fn new(api_key: impl Into<String>, client: ClientMetadata) -> Result<Self> {
        Ok(Self {
            base_url: Url::parse(DEFAULT_BASE_URL)?,
            api_key: api_key.into(),
            client,
            http_timeouts: HttpTimeouts::default(),
            flow_timeout: FLOW_TIMEOUT,
            default_poll_interval: DEFAULT_POLL_INTERVAL,
            data_dir: Self::default_data_dir()?,
            user_agent: Some("codeflow".to_string()),
        })
    }

    /// Get the default data directory for the current platform
    pub fn default_data_dir() -> Result<PathBuf> {
        let project_dirs = directories::ProjectDirs::from("", "", "codeflow").ok_or_else(|| {
            AuthError::Storage("Could not determine config directory".to_string())
        })?;

        Ok(project_dirs.config_dir().to_path_buf())
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    pub fn session_store_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_STORE_FILE)
    }

    pub fn context_path(&self) -> PathBuf {
        self.data_dir.join(CONTEXT_FILE)
    }

    pub fn legacy_credentials_path(&self) -> PathBuf {
        self.data_dir.join(LEGACY_CREDENTIALS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        let mut config = AuthConfig::new(
            "test-api-key",
            ClientMetadata::detect("codeflow-test", "0.0.0"),
        )
        .unwrap();
        config.data_dir = PathBuf::from("/tmp/codeflow-test");
        config
    }

    #[test]
    fn endpoint_joins_against_base() {
        let config = test_config();
        let url = config.endpoint(endpoints::FLOW_START).unwrap();
        assert_eq!(url.as_str(), "https://api.codeflow.dev/auth/flow/start");
    }

    #[test]
    fn storage_paths_live_under_data_dir() {
        let config = test_config();
        assert!(config.session_store_path().ends_with("session.json"));
        assert!(config.context_path().ends_with("context.json"));
        assert!(config.legacy_credentials_path().ends_with("credentials.json"));
    }

    #[test]
    fn detected_metadata_has_platform() {
        let meta = ClientMetadata::detect("codeflow", "1.2.3");
        assert_eq!(meta.name, "codeflow");
        assert_eq!(meta.version, "1.2.3");
        assert!(!meta.platform.is_empty());
    }
}
