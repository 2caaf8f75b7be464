use serde::{Deserialize, Serialize};

/// A single redaction rule: literal substring replacement.
///
/// Rules are literal substrings, not a pattern language, so a redaction
/// pipeline can never be turned into an execution surface by config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionRule {
    /// Rule name recorded in blob metadata when the rule fires.
    pub name: String,
    /// Literal substring to replace.
    pub find: String,
    /// Replacement text.
    #[serde(default = "d_replacement")]
    pub replace: String,
}

/// Blob store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Redaction rules applied to payloads before hashing.
    #[serde(default)]
    pub redaction: Vec<RedactionRule>,
    /// Mask bare secret-looking tokens (long unbroken alphanumeric runs)
    /// in addition to the configured rules.
    #[serde(default)]
    pub mask_secret_tokens: bool,
    /// Environment variable holding the HMAC key for pre-image MACs.
    /// When the variable is unset, redacted blobs carry no pre-image MAC.
    #[serde(default = "d_hmac_key_env")]
    pub hmac_key_env: String,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            redaction: Vec::new(),
            mask_secret_tokens: false,
            hmac_key_env: d_hmac_key_env(),
        }
    }
}

fn d_replacement() -> String {
    "[redacted]".into()
}

fn d_hmac_key_env() -> String {
    "SIBYL_REDACTION_KEY".into()
}
