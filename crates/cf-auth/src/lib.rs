//! Delegated authentication and session management for the codeflow CLI
//!
//! This crate authenticates a human against the codeflow backend through a
//! browser without the CLI ever seeing the authorization proof in plaintext,
//! and maintains a durable local session that survives process restarts.
//!
//! # Authentication Flow
//!
//! One login attempt consists of:
//!
//! 1. Generate an ephemeral X25519 keypair for the attempt
//! 2. Start a backend-managed login flow, registering the public key
//! 3. Hand the verification URL to the user (and best-effort open a browser)
//! 4. Poll the flow until the user finishes in the browser
//! 5. Decrypt the returned token pair with the attempt's private key
//! 6. Persist the session through the storage bridge and record the user
//!    context
//! 7. Surface a pending multi-factor challenge, if any, as a continuation
//!
//! The backend encrypts the token pair to the attempt's public key, so only
//! the process that started the flow can read it. Keys live in memory for one
//! attempt and are discarded with it.
//!
//! # Example
//!
//! ```no_run
//! use cf_auth::{AuthConfig, AuthError, AuthOptions, ClientMetadata, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AuthConfig::new(
//!         "publishable-key",
//!         ClientMetadata::detect("codeflow", env!("CARGO_PKG_VERSION")),
//!     )?;
//!     let manager = SessionManager::new(config).await?;
//!
//!     if manager.has_valid_session().await {
//!         return Ok(());
//!     }
//!
//!     let mut options = AuthOptions::default();
//!     options.events.on_auth_url = Some(Box::new(|url| {
//!         println!("Open this URL to sign in:\n  {url}");
//!     }));
//!
//!     match manager.authenticate(&options).await {
//!         Ok(credentials) => println!("Signed in as {}", credentials.user_id),
//!         // Not a failure: the login continues with a second factor
//!         Err(AuthError::MfaRequired(challenge)) => {
//!             let code = "123456"; // prompt the user
//!             let credentials = manager.verify_mfa(&challenge.factor_id, code).await?;
//!             println!("Signed in as {}", credentials.user_id);
//!         }
//!         Err(err) => return Err(err.into()),
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Session Storage
//!
//! The identity client persists its session through the [`SessionStorage`]
//! contract. [`FileSessionStore`] keeps one owner-only JSON file and makes
//! every write durable before returning, because the backend's refresh
//! rotation invalidates the old refresh token the moment it issues a new one -
//! losing that write is a lockout. [`MemorySessionStore`] backs tests.
//!
//! # Important Notes
//!
//! - Tokens and private keys are never logged; key material has redacted
//!   `Debug` output
//! - [`AuthError::MfaRequired`] is a continuation of login, not a failure,
//!   and is never routed through `on_error`
//! - Every error carries a stable code ([`AuthError::code`]) for mapping to
//!   remediation text

pub mod config;
pub mod context;
pub mod crypto;
pub mod errors;
pub mod flow;
pub mod identity;
pub mod models;
pub mod session;
pub mod storage;

// Re-export main types
pub use config::{AuthConfig, ClientMetadata, HttpTimeouts};
pub use context::ContextStore;
pub use crypto::FlowKeyPair;
pub use errors::{AuthError, Result};
pub use flow::{AuthEvents, AuthOptions, BrowserLauncher, Clock, OAuthService, TokioClock};
pub use identity::{HttpIdentityClient, IdentityClient};
pub use models::{
    AuthCredentials, EncryptedTokenPayload, FlowState, MfaChallenge, MfaRequirement, TokenPair,
    UserContext, UserInfo,
};
pub use session::SessionManager;
pub use storage::{FileSessionStore, MemorySessionStore, SessionStorage};
