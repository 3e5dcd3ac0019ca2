//! The MD5 password challenge/response scheme PostgreSQL clients already
//! speak: `"md5" + md5hex( md5hex(password || user) || salt )`.

use md5::{Digest, Md5};

fn md5_hex(chunks: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    format!("{:x}", hasher.finalize())
}

/// The hash a client's `PasswordMessage` is expected to carry, given the
/// plaintext password on file, the connecting user, and the salt this
/// `Context` generated for its `AuthenticationMD5Password` challenge.
pub fn expected_hash(password: &str, user: &str, salt: &[u8; 4]) -> String {
    let inner = md5_hex(&[password.as_bytes(), user.as_bytes()]);
    format!("md5{}", md5_hex(&[inner.as_bytes(), salt]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_reference_formula() {
        let salt = [1, 2, 3, 4];
        let hash = expected_hash("secret", "alice", &salt);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 3 + 32);
    }

    #[test]
    fn is_deterministic() {
        let salt = [9, 9, 9, 9];
        assert_eq!(
            expected_hash("pw", "bob", &salt),
            expected_hash("pw", "bob", &salt)
        );
    }

    #[test]
    fn differs_per_salt() {
        assert_ne!(
            expected_hash("pw", "bob", &[1, 1, 1, 1]),
            expected_hash("pw", "bob", &[2, 2, 2, 2])
        );
    }
}
