use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of the `state` parameter.
pub const STATE_LENGTH: usize = 43;

/// Length of the PKCE code verifier (RFC 7636 maximum).
pub const CODE_VERIFIER_LENGTH: usize = 128;

/// Code verifier and its S256 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

/// Generates a URL-safe random string of exactly `length` characters.
///
/// Draws `length` bytes from the thread-local CSPRNG, base64url-encodes them
/// without padding and truncates. The output alphabet is `[A-Za-z0-9_-]`.
#[must_use]
pub fn generate_random_string(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::rng().fill_bytes(&mut bytes);
    let mut encoded = URL_SAFE_NO_PAD.encode(&bytes);
    encoded.truncate(length);
    encoded
}

/// Generates a cryptographically random `state` parameter (43 characters).
#[must_use]
pub fn generate_state() -> String {
    generate_random_string(STATE_LENGTH)
}

/// Generates a cryptographically random code verifier (128 characters).
#[must_use]
pub fn generate_code_verifier() -> String {
    generate_random_string(CODE_VERIFIER_LENGTH)
}

/// Computes the S256 code challenge from a code verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Derives the PKCE pair for an existing verifier.
#[must_use]
pub fn derive_pkce(code_verifier: impl Into<String>) -> PkcePair {
    let code_verifier = code_verifier.into();
    let code_challenge = generate_code_challenge(&code_verifier);
    PkcePair {
        code_verifier,
        code_challenge,
    }
}

/// Generates a fresh verifier and derives its challenge.
#[must_use]
pub fn generate_pkce() -> PkcePair {
    derive_pkce(generate_code_verifier())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_url_safe(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn test_random_string_exact_length() {
        for length in [1, 22, 43, 64, 100, 128] {
            assert_eq!(generate_random_string(length).len(), length);
        }
    }

    #[test]
    fn test_random_string_url_safe() {
        let s = generate_random_string(128);
        assert!(is_url_safe(&s), "string should be URL-safe: {s}");
        assert!(!s.contains('+') && !s.contains('/') && !s.contains('='));
    }

    #[test]
    fn test_code_verifier_length() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 128);
        assert!(is_url_safe(&verifier));
    }

    #[test]
    fn test_code_verifier_uniqueness() {
        let v1 = generate_code_verifier();
        let v2 = generate_code_verifier();
        assert_ne!(v1, v2, "verifiers should be unique");
    }

    #[test]
    fn test_state_length() {
        let state = generate_state();
        assert_eq!(state.len(), 43);
        assert!(is_url_safe(&state));
    }

    #[test]
    fn test_code_challenge_deterministic() {
        let p1 = derive_pkce("test_verifier_string");
        let p2 = derive_pkce("test_verifier_string");
        assert_eq!(p1, p2, "challenge should be deterministic");
    }

    #[test]
    fn test_code_challenge_known_vector() {
        // RFC 7636, Appendix B
        let pair = derive_pkce("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(
            pair.code_challenge,
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_code_challenge_is_sha256_base64url() {
        let pair = generate_pkce();
        assert_eq!(pair.code_challenge.len(), 43);
        assert!(is_url_safe(&pair.code_challenge));
        let decoded = URL_SAFE_NO_PAD.decode(&pair.code_challenge).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_code_challenge_different_for_different_verifiers() {
        let c1 = generate_code_challenge("verifier_1");
        let c2 = generate_code_challenge("verifier_2");
        assert_ne!(c1, c2);
    }
}
