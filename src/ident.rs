//! Identifier generator: UUID v4 strings and CSPRNG byte sequences.

use base64::Engine;
use rand::RngExt;

/// Default Hawk header nonce length in bytes.
pub const DEFAULT_NONCE_BYTES: usize = 6;

/// Generate a random UUID v4 string.
pub fn gen_uuid4() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Fill `len` bytes from the thread-local CSPRNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    bytes
}

/// Generate a base64 nonce of `len` random bytes (6 when `len` is 0).
pub fn gen_nonce(len: usize) -> String {
    let len = if len == 0 { DEFAULT_NONCE_BYTES } else { len };
    base64::engine::general_purpose::STANDARD.encode(random_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid4_is_unique_and_well_formed() {
        let a = gen_uuid4();
        let b = gen_uuid4();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.chars().nth(14), Some('4'));
    }

    #[test]
    fn random_bytes_has_requested_length() {
        assert_eq!(random_bytes(0).len(), 0);
        assert_eq!(random_bytes(32).len(), 32);
        assert_ne!(random_bytes(16), random_bytes(16));
    }

    #[test]
    fn nonce_defaults_to_six_bytes() {
        // 6 bytes encode to 8 base64 characters without padding.
        assert_eq!(gen_nonce(0).len(), 8);
        assert_eq!(gen_nonce(12).len(), 16);
    }
}
