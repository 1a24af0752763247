use std::time::Duration;

use thiserror::Error;

use crate::models::MfaChallenge;

/// Authentication and session error types
///
/// Every escalated error carries a stable machine code (see [`AuthError::code`])
/// so the CLI layer can map codes to remediation text.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Could not reach the authentication backend: {0}")]
    BackendUnreachable(#[source] reqwest::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("Backend rejected the login flow: {message}")]
    StartFlowFailed { message: String },

    #[error("Login flow not found - it may have been cancelled on the server")]
    FlowNotFound,

    #[error("Authentication failed: {description}")]
    OAuthFailed { description: String },

    #[error("Login flow expired before it was completed in the browser")]
    FlowExpired,

    #[error("Timed out after {waited:?} waiting for browser authentication")]
    Timeout { waited: Duration },

    #[error("Login flow completed but the backend returned no token payload")]
    MissingTokens,

    #[error("Token decryption failed: {0}")]
    Crypto(String),

    #[error("Multi-factor verification required (factor {})", .0.factor_id)]
    MfaRequired(MfaChallenge),

    #[error("Backend requires multi-factor verification but returned an unusable challenge")]
    MfaChallengeIncomplete,

    #[error("Session refresh failed - run login again")]
    RefreshFailed,

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::BackendUnreachable(_) => "BACKEND_UNREACHABLE",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Http { .. } => "HTTP_ERROR",
            Self::StartFlowFailed { .. } => "START_FLOW_FAILED",
            Self::FlowNotFound => "FLOW_NOT_FOUND",
            Self::OAuthFailed { .. } => "OAUTH_FAILED",
            Self::FlowExpired => "FLOW_EXPIRED",
            Self::Timeout { .. } => "FLOW_TIMEOUT",
            Self::MissingTokens => "MISSING_TOKENS",
            Self::Crypto(_) => "DECRYPT_FAILED",
            Self::MfaRequired(_) => "MFA_REQUIRED",
            Self::MfaChallengeIncomplete => "MFA_REQUIRED_INCOMPLETE",
            Self::RefreshFailed => "REFRESH_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serde(_) => "INVALID_JSON",
            Self::UrlParse(_) => "INVALID_URL",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }

    /// Whether this error is the multi-factor continuation rather than a failure
    ///
    /// `MFA_REQUIRED` means "call `verify_mfa` next" and must not be routed
    /// through the failure-notification callback.
    pub fn is_mfa_continuation(&self) -> bool {
        matches!(self, Self::MfaRequired(_))
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mfa_required_is_a_continuation() {
        let err = AuthError::MfaRequired(MfaChallenge {
            factor_id: "factor-1".to_string(),
            factor_type: "totp".to_string(),
        });
        assert!(err.is_mfa_continuation());
        assert_eq!(err.code(), "MFA_REQUIRED");
    }

    #[test]
    fn incomplete_challenge_is_a_failure() {
        let err = AuthError::MfaChallengeIncomplete;
        assert!(!err.is_mfa_continuation());
        assert_eq!(err.code(), "MFA_REQUIRED_INCOMPLETE");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::FlowNotFound.code(), "FLOW_NOT_FOUND");
        assert_eq!(AuthError::MissingTokens.code(), "MISSING_TOKENS");
        assert_eq!(AuthError::RefreshFailed.code(), "REFRESH_FAILED");
        assert_eq!(
            AuthError::Timeout {
                waited: Duration::from_secs(300)
            }
            .code(),
            "FLOW_TIMEOUT"
        );
    }
}
