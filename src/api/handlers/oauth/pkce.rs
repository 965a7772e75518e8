//! PKCE (RFC 7636), S256 only.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

pub const CODE_CHALLENGE_METHOD_S256: &str = "S256";

const VERIFIER_MIN_LEN: usize = 43;
const VERIFIER_MAX_LEN: usize = 128;

/// Check the verifier alphabet and length from RFC 7636 section 4.1.
#[must_use]
pub fn valid_verifier(verifier: &str) -> bool {
    if verifier.len() < VERIFIER_MIN_LEN || verifier.len() > VERIFIER_MAX_LEN {
        return false;
    }
    verifier
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~'))
}

/// Verify an S256 challenge: `BASE64URL(SHA256(verifier)) == challenge`.
#[must_use]
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    if !valid_verifier(verifier) {
        return false;
    }
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest) == challenge
}
