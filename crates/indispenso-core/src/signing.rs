//! HMAC primitives shared by the server and the nodes.
//!
//! All digests travel as padded URL-safe base64.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Number of random bytes in a per-client auth token.
pub const TOKEN_BYTES: usize = 32;

/// HMAC-SHA256 over the concatenation of `parts`, base64url encoded.
pub fn hmac_b64(key: &[u8], parts: &[&[u8]]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    for part in parts {
        mac.update(part);
    }
    Some(URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of a presented digest against the expected one.
pub fn verify_b64(key: &[u8], parts: &[&[u8]], presented: &str) -> bool {
    let Ok(presented) = URL_SAFE.decode(presented) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(&presented).is_ok()
}

/// Generate a fresh per-client auth token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

/// Decode a per-client auth token into HMAC key bytes.
pub fn decode_token(token: &str) -> Option<Vec<u8>> {
    URL_SAFE.decode(token).ok()
}

/// Signature handed out with a token so a node can check it came from a
/// server holding the same pre-shared secure token.
pub fn token_signature(secure_token: &str, token: &str) -> Option<String> {
    hmac_b64(secure_token.as_bytes(), &[token.as_bytes()])
}

/// Value of the `X-Auth` header for a request path including its query.
pub fn request_signature(secure_token: &str, path_and_query: &str) -> Option<String> {
    hmac_b64(secure_token.as_bytes(), &[path_and_query.as_bytes()])
}

/// Check an `X-Auth` header value.
pub fn verify_request(secure_token: &str, path_and_query: &str, presented: &str) -> bool {
    verify_b64(
        secure_token.as_bytes(),
        &[path_and_query.as_bytes()],
        presented,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_decode_to_32_bytes() {
        let token = generate_token();
        assert_eq!(decode_token(&token).unwrap().len(), TOKEN_BYTES);
        assert_ne!(token, generate_token());
    }

    #[test]
    fn request_signature_verifies() {
        let sig = request_signature("secret", "/client/a/cmds?_rand=x").unwrap();
        assert!(verify_request("secret", "/client/a/cmds?_rand=x", &sig));
        assert!(!verify_request("secret", "/client/b/cmds?_rand=x", &sig));
        assert!(!verify_request("other", "/client/a/cmds?_rand=x", &sig));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        assert!(!verify_request("secret", "/", "not base64 at all!"));
        assert!(!verify_request("secret", "/", ""));
    }

    #[test]
    fn token_signature_depends_on_secure_token() {
        let a = token_signature("one", "tok").unwrap();
        let b = token_signature("two", "tok").unwrap();
        assert_ne!(a, b);
    }
}
