//! PKCE (Proof Key for Code Exchange) and `state` values for the authorization URL.
//!
//! PKCE binds the authorization code to the client that started the flow, so
//! a code intercepted on the redirect cannot be exchanged by anyone else.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// PKCE verifier and challenge pair.
#[derive(Debug, Clone)]
pub struct Pkce {
    /// Code verifier - a cryptographically random string (43-128 characters).
    pub verifier: String,
    /// Code challenge - base64url(sha256(verifier)).
    pub challenge: String,
}

impl Pkce {
    /// Generate a new PKCE verifier and challenge pair.
    ///
    /// The verifier is 64 random bytes, base64url encoded (86 characters).
    pub fn new() -> Self {
        let verifier = random_base64(64);
        let challenge = Self::compute_challenge(&verifier);

        Self {
            verifier,
            challenge,
        }
    }

    /// The challenge method sent alongside the challenge.
    pub const fn method() -> &'static str {
        "S256"
    }

    /// Compute S256 challenge from verifier: base64url(sha256(verifier))
    fn compute_challenge(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let hash = hasher.finalize();

        URL_SAFE_NO_PAD.encode(hash)
    }
}

impl Default for Pkce {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate an opaque `state` value for one authorization round trip.
pub fn random_state() -> String {
    random_base64(32)
}

fn random_base64(num_bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..num_bytes).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_base64url(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn test_pkce_generation() {
        let pkce = Pkce::new();

        // 64 bytes base64url encoded
        assert_eq!(pkce.verifier.len(), 86);
        assert!(is_base64url(&pkce.verifier));

        // SHA-256 digest base64url encoded
        assert_eq!(pkce.challenge.len(), 43);
        assert!(is_base64url(&pkce.challenge));
    }

    #[test]
    fn test_challenge_is_deterministic() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            Pkce::compute_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_different_verifiers_produce_different_challenges() {
        let pkce1 = Pkce::new();
        let pkce2 = Pkce::new();

        assert_ne!(pkce1.verifier, pkce2.verifier);
        assert_ne!(pkce1.challenge, pkce2.challenge);
    }

    #[test]
    fn test_random_state() {
        let state = random_state();
        assert_eq!(state.len(), 43);
        assert!(is_base64url(&state));
        assert_ne!(state, random_state());
    }
}
