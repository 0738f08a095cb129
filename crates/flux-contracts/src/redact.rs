/// Marker placed in front of the visible tail of a redacted secret.
pub const REDACTED_PREFIX: &str = "***";
/// Replacement for secrets too short to show any of.
pub const FULLY_REDACTED: &str = "[REDACTED]";

const MIN_PARTIAL_LEN: usize = 8;
const VISIBLE_TAIL: usize = 4;

/// Renders a credential for log output: the fixed prefix plus the last four
/// characters, or a full redaction when the secret is shorter than eight
/// characters.
pub fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    let count = trimmed.chars().count();
    if count < MIN_PARTIAL_LEN {
        return FULLY_REDACTED.to_string();
    }
    let tail: String = trimmed.chars().skip(count - VISIBLE_TAIL).collect();
    format!("{REDACTED_PREFIX}{tail}")
}

/// Replaces every occurrence of `secret` in `text` with its redacted form.
pub fn scrub_secret(text: &str, secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return text.to_string();
    }
    text.replace(trimmed, &redact_secret(trimmed))
}
