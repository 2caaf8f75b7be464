use std::fmt;

use serde::{Deserialize, Serialize};

/// The `{provider, model, version}` triple that disambiguates otherwise
/// identical requests. Attached to every gateway response; consulted by
/// the memoizer and by deterministic-replay audits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderFingerprint {
    pub provider: String,
    pub model: String,
    pub version: String,
}

impl ProviderFingerprint {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ProviderFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.provider, self.model, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        let fp = ProviderFingerprint::new("openai", "gpt-5", "2026-05");
        assert_eq!(fp.to_string(), "openai/gpt-5@2026-05");
    }

    #[test]
    fn equality_is_field_wise() {
        let a = ProviderFingerprint::new("p", "m", "1");
        let b = ProviderFingerprint::new("p", "m", "1");
        let c = ProviderFingerprint::new("p", "m", "2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
