//! SHA-256 content digests.
//!
//! Digests are always lower-case hex. Manifests may carry a `sha256:` prefix,
//! which [`normalize`] strips.

use sha2::{Digest, Sha256};

/// Computes the lower-case hex SHA-256 digest of `bytes`.
pub fn compute(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Returns `true` only if the digest of `bytes` equals `expected` exactly.
///
/// The comparison runs over every byte regardless of where the first
/// difference is.
pub fn verify(bytes: &[u8], expected: &str) -> bool {
    constant_time_eq(compute(bytes).as_bytes(), expected.as_bytes())
}

/// Strips the `sha256:` prefix from a digest if present and lower-cases it.
pub fn normalize(digest: &str) -> String {
    let digest = digest.trim();
    digest
        .strip_prefix("sha256:")
        .unwrap_or(digest)
        .to_ascii_lowercase()
}

/// Whether `digest` looks like a normalized SHA-256 hex string.
pub fn is_well_formed(digest: &str) -> bool {
    digest.len() == 64 && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Short form used in directory names and listings.
pub fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_compute_known_digest() {
        assert_eq!(compute(b"hello"), HELLO);
    }

    #[test]
    fn test_verify_accepts_exact_digest() {
        assert!(verify(b"hello", HELLO));
    }

    #[test]
    fn test_verify_rejects_flipped_bit() {
        let mut payload = b"hello".to_vec();
        payload[2] ^= 0b0000_0100;
        assert!(!verify(&payload, HELLO));
    }

    #[test]
    fn test_verify_rejects_upper_case_and_truncated() {
        assert!(!verify(b"hello", &HELLO.to_uppercase()));
        assert!(!verify(b"hello", &HELLO[..63]));
        assert!(!verify(b"hello", ""));
    }

    #[test]
    fn test_normalize_removes_prefix() {
        let input = format!("sha256:{}", HELLO.to_uppercase());
        assert_eq!(normalize(&input), HELLO);
        assert_eq!(normalize(HELLO), HELLO);
    }

    #[test]
    fn test_is_well_formed() {
        assert!(is_well_formed(HELLO));
        assert!(!is_well_formed("abc"));
        assert!(!is_well_formed(&HELLO.replace('a', "g")));
    }

    #[test]
    fn test_short_handles_any_input() {
        assert_eq!(short(HELLO), "2cf24dba5fb0");
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("ééééééé"), "éééééé");
        assert_eq!(short("aéééééé"), "aéééééé");
    }
}
