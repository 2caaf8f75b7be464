//! Masking for secret-looking tokens in text headed for logs, readiness
//! reports, or stored blobs.

/// Minimum length of an unbroken alphanumeric run treated as a secret
/// token.
const SECRET_TOKEN_MIN_LEN: usize = 20;

/// Mask substrings that look like API keys or bearer tokens: unbroken
/// alphanumeric/`-`/`_` runs of at least [`SECRET_TOKEN_MIN_LEN`] chars.
/// Keeps a short prefix and suffix so operators can still correlate.
pub fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= SECRET_TOKEN_MIN_LEN
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..]);
            result = result.replace(trimmed, &masked);
        }
    }
    result
}
