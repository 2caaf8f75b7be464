//! Provider error classification.
//!
//! Adapters call [`classify`] at the gateway boundary so every error that
//! reaches the scheduler is already either `ProviderRetryable` or
//! `ProviderTerminal`. Rate limits, transient network failures, and 5xx
//! responses are retryable; authentication, invalid requests, and content
//! policy rejections are not.

use sibyl_domain::error::Error;

/// Classify a provider failure into the runtime taxonomy.
///
/// `status` is the HTTP-like status code when one exists; transport-level
/// failures pass `None` and classify by message.
pub fn classify(provider: &str, status: Option<u16>, message: &str) -> Error {
    let retryable = match status {
        Some(429) => true,
        Some(code) if (500..600).contains(&code) => true,
        Some(408) => true,
        Some(_) => false,
        None => is_transient_message(message),
    };

    if retryable {
        Error::ProviderRetryable {
            provider: provider.to_owned(),
            message: message.to_owned(),
        }
    } else {
        Error::ProviderTerminal {
            provider: provider.to_owned(),
            message: message.to_owned(),
        }
    }
}

/// Heuristic for transport errors that carry no status code.
fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["timed out", "timeout", "connection reset", "connection refused", "temporarily"]
        .iter()
        .any(|needle| lower.contains(needle))
}
