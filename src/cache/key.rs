//! Cache keys: SHA-256 over prompt, model and generation parameters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::agent::SendParams;

/// Hex-encoded content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash a rendered prompt with the model and parameters that shape its answer.
    pub fn new(prompt: &str, model: &str, params: &SendParams) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        // SendParams serializes deterministically (fixed fields + BTreeMap).
        hasher.update(serde_json::to_vec(params).unwrap_or_default());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is plenty for logs.
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable_hex() {
        let key = CacheKey::new("prompt", "model", &SendParams::default());
        assert_eq!(key, CacheKey::new("prompt", "model", &SendParams::default()));
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key.to_string().len(), 12);
    }

    #[test]
    fn test_key_depends_on_every_component() {
        let base = CacheKey::new("prompt", "model", &SendParams::default());
        assert_ne!(base, CacheKey::new("prompt!", "model", &SendParams::default()));
        assert_ne!(base, CacheKey::new("prompt", "model-2", &SendParams::default()));
        assert_ne!(
            base,
            CacheKey::new("prompt", "model", &SendParams::default().with_temperature(0.2))
        );
    }

    #[test]
    fn test_separator_prevents_ambiguity() {
        assert_ne!(
            CacheKey::new("ab", "c", &SendParams::default()),
            CacheKey::new("a", "bc", &SendParams::default())
        );
    }
}
