use sha2::{Digest, Sha256};

/// 64-hex-char SHA-256 digest of a raw upstream API key. Raw keys are
/// never persisted or logged; only this digest identifies a key in
/// `KeyValidity` / `KeyUsage` rows.
pub fn key_hash(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_64_hex_chars_and_deterministic() {
        let a = key_hash("sk-test-123");
        let b = key_hash("sk-test-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_keys_hash_differently() {
        assert_ne!(key_hash("sk-a"), key_hash("sk-b"));
    }
}
