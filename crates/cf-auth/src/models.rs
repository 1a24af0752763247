use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TOKEN_EXPIRY_SKEW;
use crate::errors::AuthError;

/// Flow-start request body
#[derive(Debug, Clone, Serialize)]
pub struct StartFlowRequest {
    pub name: String,
    pub version: String,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub platform: String,
    pub public_key: String,
}

/// Flow-start response body
#[derive(Debug, Clone, Deserialize)]
pub struct StartFlowResponse {
    pub success: bool,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub verification_url: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds between status polls
    #[serde(default)]
    pub poll_interval: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Server-issued state identifying one login attempt
#[derive(Debug, Clone)]
pub struct FlowState {
    pub flow_id: String,
    pub verification_url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub poll_interval: Duration,
}

/// Status of a login flow as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Pending,
    Authenticating,
    Complete,
    Failed,
    Expired,
}

/// Flow-status response body
#[derive(Debug, Clone, Deserialize)]
pub struct FlowStatusResponse {
    pub success: bool,
    #[serde(default)]
    pub status: Option<FlowStatus>,
    #[serde(default)]
    pub encrypted_tokens: Option<EncryptedTokenPayload>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Encrypted token payload, meaningful only to the keypair that started the flow
///
/// `ciphertext` is base64 of `nonce(12) || ciphertext || tag(16)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedTokenPayload {
    /// Base64-encoded X25519 ephemeral public key of the sender
    pub ephemeral_public_key: String,
    pub ciphertext: String,
}

/// Decrypted token pair as issued by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access-token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub user: Option<UserInfo>,
}

/// Refresh-token grant request body
#[derive(Debug, Clone, Serialize)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

/// One-time-code grant request body
#[derive(Debug, Clone, Serialize)]
pub struct OneTimeCodeRequest {
    pub code: String,
}

/// Multi-factor verification request body
#[derive(Debug, Clone, Serialize)]
pub struct MfaVerifyRequest {
    pub factor_id: String,
    pub code: String,
}

/// Minimal user identity returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Multi-factor requirement reported after a successful primary factor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MfaRequirement {
    pub required: bool,
    #[serde(default)]
    pub factor_id: Option<String>,
    #[serde(default)]
    pub factor_type: Option<String>,
}

impl MfaRequirement {
    /// Turn a requirement into the login-continuation error, if any
    ///
    /// A required challenge with both fields is the `MFA_REQUIRED`
    /// continuation; a required challenge missing either field is the
    /// `MFA_REQUIRED_INCOMPLETE` failure.
    pub fn into_gate(self) -> Option<AuthError> {
        if !self.required {
            return None;
        }
        match (self.factor_id, self.factor_type) {
            (Some(factor_id), Some(factor_type)) => Some(AuthError::MfaRequired(MfaChallenge {
                factor_id,
                factor_type,
            })),
            _ => Some(AuthError::MfaChallengeIncomplete),
        }
    }
}

/// A usable multi-factor challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub factor_id: String,
    pub factor_type: String,
}

/// The session record the identity client persists through the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentitySession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserInfo,
    pub saved_at: DateTime<Utc>,
}

impl StoredIdentitySession {
    /// Build a session record from a freshly issued token pair
    pub fn from_tokens(tokens: TokenPair, user: UserInfo) -> Self {
        let expires_in = tokens.expires_in.unwrap_or(3600);
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: tokens.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in as i64),
            user,
            saved_at: Utc::now(),
        }
    }

    /// Whether the access token is expired, applying the refresh skew
    pub fn is_expired(&self) -> bool {
        let skew = chrono::Duration::from_std(TOKEN_EXPIRY_SKEW)
            .unwrap_or(chrono::Duration::seconds(30));
        Utc::now() + skew >= self.expires_at
    }
}

/// Credentials handed to the rest of the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredentials {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: String,
    pub saved_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_context: Option<String>,
}

impl AuthCredentials {
    /// Assemble credentials from the backend session plus the locally stored
    /// non-auth context
    pub fn assemble(session: &StoredIdentitySession, selected_context: Option<String>) -> Self {
        Self {
            token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            user_id: session.user.id.clone(),
            email: session.user.email.clone(),
            expires_at: Some(session.expires_at),
            token_type: session.token_type.clone(),
            saved_at: session.saved_at,
            selected_context,
        }
    }
}

/// Non-auth user context persisted next to the session store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub selected_context: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}
