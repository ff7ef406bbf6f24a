// SPDX-License-Identifier: MIT

//! Random identifiers for transient scope names (spec.md §3: "randomized
//! unit name `<prefix>-<128-bit-hex>.scope`").

use rand::RngCore;

/// 128 bits of randomness, lowercase hex-encoded (32 characters).
pub fn random_hex_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_32_hex_chars() {
        let id = random_hex_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn is_not_constant() {
        assert_ne!(random_hex_id(), random_hex_id());
    }
}
