//! Content-hash identity of one recorded invocation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hex-encoded content digest identifying a call.
///
/// The digest length depends on the hash used by the fingerprint engine
/// (SHA-256 today, 64 hex characters); this type only guarantees that the
/// text is lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Encode raw digest bytes.
    #[must_use]
    pub fn from_digest(bytes: &[u8]) -> Self {
        use std::fmt::Write as _;
        let mut hex = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Accept an already-encoded digest, e.g. a storage key.
    ///
    /// Returns `None` unless the text is non-empty lowercase hex.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let valid = !text.is_empty()
            && text
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(text.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_digest_is_lowercase_hex() {
        let fp = Fingerprint::from_digest(&[0x00, 0xab, 0xff]);
        assert_eq!(fp.as_str(), "00abff");
        assert_eq!(fp.short(), "00abff");
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert!(Fingerprint::parse("00abff").is_some());
        assert!(Fingerprint::parse("").is_none());
        assert!(Fingerprint::parse("00ABFF").is_none());
        assert!(Fingerprint::parse("zz").is_none());
    }
}
