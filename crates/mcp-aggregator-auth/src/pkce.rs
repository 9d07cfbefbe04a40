use base64::Engine;
use sha2::{Digest, Sha256};

/// Verifies `S256` PKCE: `base64url(sha256(verifier)) == challenge`.
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    let digest = Sha256::digest(verifier.as_bytes());
    let computed = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    constant_time_eq(&computed, challenge)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_known_s256_pair() {
        // verifier "hello", sha256("hello") base64url-no-pad
        let verifier = "hello";
        let expected = {
            let digest = Sha256::digest(verifier.as_bytes());
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
        };
        assert!(verify_s256(verifier, &expected));
        assert!(!verify_s256(verifier, "not-the-right-challenge"));
    }
}
