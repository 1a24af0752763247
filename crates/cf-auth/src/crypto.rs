use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::errors::{AuthError, Result};
use crate::models::{EncryptedTokenPayload, TokenPair};

/// X25519 key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (96 bits)
const NONCE_SIZE: usize = 12;

/// HKDF info string binding derived keys to this payload format
const HKDF_INFO: &[u8] = b"codeflow-login-tokens-v1";

/// Ephemeral keypair for one login attempt
///
/// Generated fresh per attempt, held only in process memory, never persisted,
/// and discarded when the attempt ends. The backend encrypts the token pair so
/// that only the holder of the private half can read it.
pub struct FlowKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl FlowKeyPair {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Base64-encoded public key, sent to the backend when starting a flow
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Derive the symmetric key for a payload sealed to this keypair
    fn derive_key(&self, ephemeral_public: &PublicKey, flow_id: &str) -> Result<[u8; KEY_SIZE]> {
        let shared = self.secret.diffie_hellman(ephemeral_public);
        expand_key(shared.as_bytes(), flow_id)
    }
}

impl std::fmt::Debug for FlowKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FlowKeyPair([REDACTED])")
    }
}

/// HKDF-SHA256 expansion of an ECDH shared secret, salted by the flow id
fn expand_key(shared_secret: &[u8; KEY_SIZE], flow_id: &str) -> Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(Some(flow_id.as_bytes()), shared_secret);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| AuthError::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(key)
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| AuthError::Crypto(format!("Invalid key encoding: {}", e)))?;
    if bytes.len() != KEY_SIZE {
        return Err(AuthError::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Encrypt a token pair for the holder of `recipient_public_key_b64`
///
/// Mirrors what the backend does on flow completion: ephemeral X25519 ECDH
/// against the flow's public key, HKDF-SHA256 keyed by the flow id, then
/// AES-256-GCM. The returned ciphertext is base64 of
/// `nonce(12) || ciphertext || tag(16)`.
pub fn seal_tokens(
    tokens: &TokenPair,
    recipient_public_key_b64: &str,
    flow_id: &str,
) -> Result<EncryptedTokenPayload> {
    let recipient_public = PublicKey::from(decode_key(recipient_public_key_b64)?);

    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient_public);
    let key = expand_key(shared.as_bytes(), flow_id)?;

    let plaintext = Zeroizing::new(serde_json::to_vec(tokens)?);

    let cipher = Aes256Gcm::new((&key).into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| AuthError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(EncryptedTokenPayload {
        ephemeral_public_key: BASE64.encode(ephemeral_public.as_bytes()),
        ciphertext: BASE64.encode(combined),
    })
}

/// Decrypt a token payload with the keypair that started the flow
///
/// Decrypts then structurally parses. Failures never carry plaintext; a
/// payload sealed to a different keypair or a different flow fails
/// authentication rather than yielding wrong tokens.
pub fn open_tokens(
    payload: &EncryptedTokenPayload,
    keys: &FlowKeyPair,
    flow_id: &str,
) -> Result<TokenPair> {
    let ephemeral_public = PublicKey::from(decode_key(&payload.ephemeral_public_key)?);
    let key = keys.derive_key(&ephemeral_public, flow_id)?;

    let combined = BASE64
        .decode(&payload.ciphertext)
        .map_err(|e| AuthError::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;

    // nonce(12) + tag(16) minimum
    if combined.len() < NONCE_SIZE + 16 {
        return Err(AuthError::Crypto("Ciphertext too short".to_string()));
    }

    let nonce = Nonce::from_slice(&combined[..NONCE_SIZE]);
    let ciphertext = &combined[NONCE_SIZE..];

    let cipher = Aes256Gcm::new((&key).into());
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| AuthError::Crypto("Authentication tag mismatch".to_string()))?,
    );

    serde_json::from_slice(&plaintext)
        .map_err(|_| AuthError::Crypto("Decrypted payload did not parse".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tokens() -> TokenPair {
        TokenPair {
            access_token: "access-token-value".to_string(),
            refresh_token: Some("refresh-token-value".to_string()),
            expires_in: Some(3600),
            token_type: Some("bearer".to_string()),
            user: None,
        }
    }

    #[test]
    fn seal_open_roundtrip() {
        let keys = FlowKeyPair::generate();
        let tokens = test_tokens();

        let payload = seal_tokens(&tokens, &keys.public_key_base64(), "flow-123").unwrap();
        let opened = open_tokens(&payload, &keys, "flow-123").unwrap();

        assert_eq!(opened, tokens);
    }

    #[test]
    fn wrong_keypair_fails_to_open() {
        let keys = FlowKeyPair::generate();
        let other = FlowKeyPair::generate();

        let payload = seal_tokens(&test_tokens(), &keys.public_key_base64(), "flow-123").unwrap();
        let result = open_tokens(&payload, &other, "flow-123");

        assert!(matches!(result, Err(AuthError::Crypto(_))));
    }

    #[test]
    fn wrong_flow_id_fails_to_open() {
        let keys = FlowKeyPair::generate();

        let payload = seal_tokens(&test_tokens(), &keys.public_key_base64(), "flow-123").unwrap();
        let result = open_tokens(&payload, &keys, "flow-456");

        assert!(matches!(result, Err(AuthError::Crypto(_))));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let keys = FlowKeyPair::generate();

        let mut payload =
            seal_tokens(&test_tokens(), &keys.public_key_base64(), "flow-123").unwrap();
        let mut combined = BASE64.decode(&payload.ciphertext).unwrap();
        let last = combined.len() - 1;
        combined[last] ^= 0xFF;
        payload.ciphertext = BASE64.encode(combined);

        let result = open_tokens(&payload, &keys, "flow-123");
        assert!(matches!(result, Err(AuthError::Crypto(_))));
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let keys = FlowKeyPair::generate();
        let payload = EncryptedTokenPayload {
            ephemeral_public_key: FlowKeyPair::generate().public_key_base64(),
            ciphertext: BASE64.encode([0u8; 20]),
        };

        let result = open_tokens(&payload, &keys, "flow-123");
        assert!(matches!(result, Err(AuthError::Crypto(_))));
    }

    #[test]
    fn keypairs_are_unique_per_attempt() {
        let a = FlowKeyPair::generate();
        let b = FlowKeyPair::generate();
        assert_ne!(a.public_key_base64(), b.public_key_base64());
    }

    #[test]
    fn decryption_error_carries_no_plaintext() {
        let keys = FlowKeyPair::generate();
        let other = FlowKeyPair::generate();

        let payload = seal_tokens(&test_tokens(), &keys.public_key_base64(), "flow-123").unwrap();
        let err = open_tokens(&payload, &other, "flow-123").unwrap_err();

        assert!(!err.to_string().contains("access-token-value"));
        assert!(!err.to_string().contains("refresh-token-value"));
    }
}
