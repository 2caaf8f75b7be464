use serde::{Deserialize, Serialize};

/// Shared error type used across all Sibyl crates.
///
/// Retryable variants are absorbed by the worker scheduler; terminal
/// provider and budget errors surface to the running step; integrity and
/// rotation failures surface at the conversation level.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("budget exhausted: requested {requested} tokens, {remaining} remaining")]
    BudgetExhausted { requested: u64, remaining: u64 },

    #[error("provider {provider} (retryable): {message}")]
    ProviderRetryable { provider: String, message: String },

    #[error("provider {provider}: {message}")]
    ProviderTerminal { provider: String, message: String },

    #[error("deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error(
        "session {session_id} rotated during call: captured generation \
         {captured}, current {current}"
    )]
    SessionRotatedDuringCall {
        session_id: String,
        captured: u64,
        current: u64,
    },

    #[error("rotation failed: {0}")]
    RotationFailed(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,

    #[error("state: {0}")]
    State(String),

    #[error("blob: {0}")]
    Blob(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant of [`Error`], used in persisted outcomes and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    BudgetExhausted,
    ProviderRetryable,
    ProviderTerminal,
    Timeout,
    SessionRotatedDuringCall,
    RotationFailed,
    IntegrityViolation,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            Self::ProviderRetryable { .. } => ErrorKind::ProviderRetryable,
            Self::ProviderTerminal { .. } => ErrorKind::ProviderTerminal,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::SessionRotatedDuringCall { .. } => ErrorKind::SessionRotatedDuringCall,
            Self::RotationFailed(_) => ErrorKind::RotationFailed,
            Self::Integrity(_) => ErrorKind::IntegrityViolation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::State(_) | Self::Blob(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether the scheduler may retry a call that failed with this error.
    ///
    /// Timeouts are retryable at most once, and only when the step policy
    /// permits; the scheduler enforces that bound separately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderRetryable { .. } | Self::Timeout { .. }
        )
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigurationError => "configuration_error",
            Self::BudgetExhausted => "budget_exhausted",
            Self::ProviderRetryable => "provider_retryable",
            Self::ProviderTerminal => "provider_terminal",
            Self::Timeout => "timeout",
            Self::SessionRotatedDuringCall => "session_rotated_during_call",
            Self::RotationFailed => "rotation_failed",
            Self::IntegrityViolation => "integrity_violation",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let retryable = Error::ProviderRetryable {
            provider: "openai".into(),
            message: "429".into(),
        };
        assert!(retryable.is_retryable());
        assert_eq!(retryable.kind(), ErrorKind::ProviderRetryable);

        let terminal = Error::ProviderTerminal {
            provider: "openai".into(),
            message: "invalid api key".into(),
        };
        assert!(!terminal.is_retryable());

        assert!(Error::Timeout { elapsed_ms: 5000 }.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::BudgetExhausted {
            requested: 800,
            remaining: 500
        }
        .is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::BudgetExhausted).unwrap();
        assert_eq!(json, "\"budget_exhausted\"");
        let json = serde_json::to_string(&ErrorKind::SessionRotatedDuringCall).unwrap();
        assert_eq!(json, "\"session_rotated_during_call\"");
    }

    #[test]
    fn kind_as_str_matches_serde() {
        for kind in [
            ErrorKind::ConfigurationError,
            ErrorKind::BudgetExhausted,
            ErrorKind::ProviderRetryable,
            ErrorKind::ProviderTerminal,
            ErrorKind::Timeout,
            ErrorKind::SessionRotatedDuringCall,
            ErrorKind::RotationFailed,
            ErrorKind::IntegrityViolation,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
