//! Redaction pipeline applied to blob payloads before hashing.
//!
//! Rules are literal substring replacements from [`BlobConfig`], plus an
//! optional secret-token masker for long unbroken alphanumeric runs. When
//! any rule fires, the pipeline records the applied rule names and an
//! HMAC-SHA256 of the pre-image under the configured key so the original
//! can still be attested without being stored.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use sibyl_domain::config::BlobConfig;
use sibyl_domain::secrets::mask_secrets;

type HmacSha256 = Hmac<Sha256>;

/// Result of running a payload through the pipeline.
#[derive(Debug, Clone)]
pub struct RedactionOutcome {
    pub bytes: Vec<u8>,
    /// Names of the rules that fired, in application order.
    pub applied: Vec<String>,
    /// Hex HMAC-SHA256 of the pre-image; present only when at least one
    /// rule fired and an HMAC key is configured.
    pub preimage_hmac: Option<String>,
}

/// A configured set of redaction rules.
pub struct RedactionPipeline {
    rules: Vec<(String, String, String)>,
    mask_secret_tokens: bool,
    hmac_key: Option<Vec<u8>>,
}

impl RedactionPipeline {
    /// Build the pipeline from config, reading the HMAC key from the
    /// configured environment variable.
    pub fn from_config(config: &BlobConfig) -> Self {
        let hmac_key = std::env::var(&config.hmac_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .map(String::into_bytes);
        Self {
            rules: config
                .redaction
                .iter()
                .map(|r| (r.name.clone(), r.find.clone(), r.replace.clone()))
                .collect(),
            mask_secret_tokens: config.mask_secret_tokens,
            hmac_key,
        }
    }

    /// A pipeline that never rewrites anything.
    pub fn disabled() -> Self {
        Self {
            rules: Vec::new(),
            mask_secret_tokens: false,
            hmac_key: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && !self.mask_secret_tokens
    }

    /// Apply the pipeline. Non-UTF-8 payloads pass through untouched;
    /// redaction operates on text.
    pub fn apply(&self, bytes: &[u8]) -> RedactionOutcome {
        if self.is_empty() {
            return RedactionOutcome {
                bytes: bytes.to_vec(),
                applied: Vec::new(),
                preimage_hmac: None,
            };
        }

        let Ok(text) = std::str::from_utf8(bytes) else {
            return RedactionOutcome {
                bytes: bytes.to_vec(),
                applied: Vec::new(),
                preimage_hmac: None,
            };
        };

        let mut applied = Vec::new();
        let mut current = text.to_owned();

        for (name, find, replace) in &self.rules {
            if find.is_empty() || !current.contains(find.as_str()) {
                continue;
            }
            current = current.replace(find.as_str(), replace);
            applied.push(name.clone());
        }

        if self.mask_secret_tokens {
            let masked = mask_secrets(&current);
            if masked != current {
                current = masked;
                applied.push("secret_tokens".to_owned());
            }
        }

        if applied.is_empty() {
            return RedactionOutcome {
                bytes: bytes.to_vec(),
                applied,
                preimage_hmac: None,
            };
        }

        let preimage_hmac = self.hmac_key.as_deref().map(|key| {
            let mut mac = HmacSha256::new_from_slice(key)
                .expect("HMAC accepts keys of any length");
            mac.update(bytes);
            hex::encode(mac.finalize().into_bytes())
        });

        RedactionOutcome {
            bytes: current.into_bytes(),
            applied,
            preimage_hmac,
        }
    }
}
