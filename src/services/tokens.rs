use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};

/// Bytes of entropy behind every invitation and link token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Opaque URL-safe token from the OS CSPRNG.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_url_safe_and_distinct() {
        let tokens: HashSet<String> = (0..256).map(|_| generate_token()).collect();
        assert_eq!(tokens.len(), 256);

        for token in &tokens {
            // 32 bytes -> 43 base64 chars without padding
            assert_eq!(token.len(), 43);
            assert!(token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }
}
