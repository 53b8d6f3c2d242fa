use thiserror::Error;

/// Substrings that reject a message outright. Matching is case-insensitive.
/// Markup injection, script URIs, inline handlers, eval, and the common
/// SQL-injection shapes.
const DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "</script",
    "<iframe",
    "<object",
    "<embed",
    "javascript:",
    "onerror=",
    "onload=",
    "onclick=",
    "eval(",
    "' or '1'='1",
    "union select",
    "drop table",
];

/// Words masked out of relayed messages, matched whole-word and
/// case-insensitively.
const PROFANITY: &[&str] = &[
    "fuck", "shit", "bitch", "asshole", "bastard", "cunt", "dick", "slut", "whore",
];

/// Reasons a message fails validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// The message is empty.
    #[error("message is empty")]
    Empty,
    /// The message exceeds the configured character limit.
    #[error("message too long: {len} > {max} characters")]
    TooLong {
        /// Observed length in characters.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The message contains a blocked substring.
    #[error("message contains disallowed content")]
    Dangerous,
}

/// Validates a chat message and returns the filtered body to relay.
///
/// Rejects empty messages, messages longer than `max_len` characters, and
/// messages containing any dangerous substring. On success the profanity
/// filter has been applied; filtering is idempotent.
pub fn validate_message(message: &str, max_len: usize) -> Result<String, ContentError> {
    if message.is_empty() {
        return Err(ContentError::Empty);
    }
    let len = message.chars().count();
    if len > max_len {
        return Err(ContentError::TooLong { len, max: max_len });
    }

    let lowered = message.to_lowercase();
    if DANGEROUS_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Err(ContentError::Dangerous);
    }

    Ok(filter_profanity(message))
}

/// Replaces each profanity-list word with asterisks of equal length.
///
/// Whole-word matching: a hit must not be preceded or followed by an
/// alphanumeric character, so embedded substrings survive untouched.
#[must_use]
pub fn filter_profanity(message: &str) -> String {
    // ASCII lowering keeps byte offsets aligned with the original; the word
    // list is ASCII so nothing is lost.
    let lowered = message.to_ascii_lowercase();
    let mut masked: Vec<u8> = message.as_bytes().to_vec();

    for word in PROFANITY {
        let mut search_from = 0;
        while let Some(pos) = lowered[search_from..].find(word) {
            let start = search_from + pos;
            let end = start + word.len();
            search_from = start + 1;

            let boundary_before = start == 0
                || !lowered[..start]
                    .chars()
                    .next_back()
                    .is_some_and(char::is_alphanumeric);
            let boundary_after = end == lowered.len()
                || !lowered[end..].chars().next().is_some_and(char::is_alphanumeric);
            if boundary_before && boundary_after {
                masked[start..end].fill(b'*');
            }
        }
    }

    // Only ASCII ranges were overwritten, so the buffer is still valid UTF-8.
    String::from_utf8(masked).unwrap_or_else(|_| message.to_string())
}
