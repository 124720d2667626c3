//! Channel name validation.
//!
//! `LISTEN` and `NOTIFY` take the channel as an identifier and cannot be
//! parameterized, so every caller-supplied name is checked before it is
//! interpolated into command text.

use crate::{PubSubError, PubSubResult};

/// Maximum identifier length in bytes (PostgreSQL `NAMEDATALEN - 1`).
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Returns true if `name` is at most 63 UTF-8 bytes and consists only of
/// ASCII letters, digits, `_` and `$`.
pub fn is_valid_identifier(name: &str) -> bool {
    name.len() <= MAX_IDENTIFIER_BYTES
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Fails with [`PubSubError::InvalidChannel`] unless `name` is valid.
pub fn validate_channel(name: &str) -> PubSubResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(PubSubError::InvalidChannel(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_identifiers() {
        assert!(is_valid_identifier("orders"));
        assert!(is_valid_identifier("test_channel_42"));
        assert!(is_valid_identifier("$price"));
        assert!(is_valid_identifier("UPPER_lower_123"));
    }

    #[test]
    fn test_length_limit_is_in_bytes() {
        let max = "a".repeat(MAX_IDENTIFIER_BYTES);
        assert!(is_valid_identifier(&max));

        let too_long = "a".repeat(MAX_IDENTIFIER_BYTES + 1);
        assert!(!is_valid_identifier(&too_long));
    }

    #[test]
    fn test_rejects_characters_outside_allowed_set() {
        for name in ["with space", "dash-name", "semi;colon", "quote'", "dot.name", "ünïcode", "tab\t"] {
            assert!(!is_valid_identifier(name), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_multibyte_names_rejected_even_when_short() {
        // 21 chars, 63 bytes: length passes but the characters do not.
        let name = "日".repeat(21);
        assert_eq!(name.len(), 63);
        assert!(!is_valid_identifier(&name));
    }

    #[test]
    fn test_validate_channel_error() {
        assert!(validate_channel("ok_name").is_ok());
        match validate_channel("not ok") {
            Err(PubSubError::InvalidChannel(name)) => assert_eq!(name, "not ok"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
