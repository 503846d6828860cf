//! Fingerprint and transform-option types. See spec §3.

use sha2::{Digest, Sha256};
use std::fmt;

/// `still: bool`, `width`/`height` of zero are never represented — they mean
/// "not specified" and are normalized away by the URL Normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TransformOptions {
    pub still: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TransformOptions {
    pub fn is_empty(&self) -> bool {
        !self.still && self.width.is_none() && self.height.is_none()
    }
}

/// Deterministic key derived from (normalized URL, transform options);
/// indexes both the cache store and the single-flight registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn compute(url: &str, options: &TransformOptions) -> Self {
        let mut hasher = Sha256::new();
        // Length-prefix each field so e.g. ("ab", 1) and ("a", "b1") can never
        // collide by naive concatenation.
        hasher.update((url.len() as u64).to_le_bytes());
        hasher.update(url.as_bytes());
        hasher.update([options.still as u8]);
        hasher.update(options.width.unwrap_or(0).to_le_bytes());
        hasher.update(options.height.unwrap_or(0).to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Fingerprint(bytes)
    }

    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_yield_equal_fingerprints() {
        let opts = TransformOptions { still: true, width: Some(200), height: None };
        let a = Fingerprint::compute("http://example.com/a.png", &opts);
        let b = Fingerprint::compute("http://example.com/a.png", &opts);
        assert_eq!(a, b);
    }

    #[test]
    fn different_options_yield_different_fingerprints() {
        let a = Fingerprint::compute(
            "http://example.com/a.png",
            &TransformOptions { still: false, width: Some(100), height: None },
        );
        let b = Fingerprint::compute(
            "http://example.com/a.png",
            &TransformOptions { still: false, width: Some(200), height: None },
        );
        assert_ne!(a, b);
    }

    #[test]
    fn hex_is_lowercase_and_64_chars() {
        let fp = Fingerprint::compute("http://example.com/a.png", &TransformOptions::default());
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
