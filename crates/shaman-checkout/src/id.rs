use crate::{CheckoutError, Result};

/// Longest accepted checkout ID, in bytes. Leaves room for a uniqueness
/// suffix within the usual 255-byte filename limit.
pub const MAX_CHECKOUT_ID_LEN: usize = 200;

/// Reject IDs that could escape the checkout root or confuse the filesystem:
/// path separators, `..`, control characters (NUL included) and drive syntax.
pub fn validate_checkout_id(checkout_id: &str) -> Result<()> {
    let invalid = checkout_id.chars().count() < 2
        || checkout_id.len() > MAX_CHECKOUT_ID_LEN
        || checkout_id.contains("..")
        || checkout_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control());

    if invalid {
        return Err(CheckoutError::InvalidCheckoutId(checkout_id.to_string()));
    }
    Ok(())
}

/// Shard directory of a validated ID: its last two characters.
pub(crate) fn shard_of(checkout_id: &str) -> &str {
    let start = checkout_id
        .char_indices()
        .rev()
        .nth(1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &checkout_id[start..]
}

/// Longest prefix of `checkout_id` that fits in `max_len` bytes, cut on a
/// character boundary.
pub(crate) fn truncate_to(checkout_id: &str, max_len: usize) -> &str {
    if checkout_id.len() <= max_len {
        return checkout_id;
    }
    let mut end = max_len;
    while !checkout_id.is_char_boundary(end) {
        end -= 1;
    }
    &checkout_id[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_uuid() {
        assert!(validate_checkout_id("5e5be786-e6d7-480c-90e6-437f9ef5bf5d").is_ok());
        assert!(validate_checkout_id("Sprite Fright, shot 012-a3f").is_ok());
    }

    #[test]
    fn test_rejects_bad_ids() {
        for id in [
            "",
            "x",
            "../../etc",
            "..",
            "jobs/42",
            "jobs\\42",
            "C:job",
            "job\0id",
            "job\nid",
            "job..id",
        ] {
            assert!(
                matches!(validate_checkout_id(id), Err(CheckoutError::InvalidCheckoutId(_))),
                "{:?} should be rejected",
                id
            );
        }
        assert!(validate_checkout_id(&"a".repeat(MAX_CHECKOUT_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_truncate_to() {
        assert_eq!(truncate_to("short", 10), "short");
        assert_eq!(truncate_to("abcdef", 4), "abcd");
        // 'é' is two bytes; never split it
        assert_eq!(truncate_to("abcé", 4), "abc");
    }

    #[test]
    fn test_shard_of() {
        assert_eq!(shard_of("5e5be786-e6d7-480c-90e6-437f9ef5bf5d"), "5d");
        assert_eq!(shard_of("ab"), "ab");
        assert_eq!(shard_of("scène-é"), "-é");
    }
}
