//! Session id generation
//!
//! Default ids are base64url of a monotonic sequence number mixed with
//! random bytes, giving sortable-enough uniqueness without coordination.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

/// Generate a session id for the given sequence number
pub fn generate(seq: u64) -> String {
    let mut buf = [0u8; 15];
    rand::thread_rng().fill_bytes(&mut buf[..7]);
    buf[7..].copy_from_slice(&seq.to_be_bytes());
    URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let mut seen = HashSet::new();
        for seq in 0..1000 {
            assert!(seen.insert(generate(seq)));
        }
    }

    #[test]
    fn test_id_is_url_safe() {
        let id = generate(42);
        assert_eq!(id.len(), 20);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
