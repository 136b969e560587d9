//! Token estimation for JSON payloads.
//!
//! The observation pipeline only needs order-of-magnitude counts to decide
//! whether a payload crosses a summarization threshold, so a serialization
//! length estimate (~4 characters per token) is used instead of a tokenizer.

use serde_json::Value;

const CHARS_PER_TOKEN: u64 = 4;

/// Estimate the token count of a JSON-serializable payload.
pub fn count_json_tokens(value: &Value) -> u64 {
    let json = serde_json::to_string(value).unwrap_or_default();
    count_text_tokens(&json)
}

/// Estimate the token count of a plain string.
pub fn count_text_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_count_text_tokens() {
        assert_eq!(count_text_tokens(""), 0);
        assert_eq!(count_text_tokens("abcd"), 1);
        assert_eq!(count_text_tokens("abcde"), 2);
    }

    #[test]
    fn test_count_json_tokens_scales_with_payload() {
        let small = json!({"key": "value"});
        let large = json!({"items": vec!["record"; 100]});
        assert!(count_json_tokens(&large) > count_json_tokens(&small));
    }
}
