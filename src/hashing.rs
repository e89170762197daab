//
// hashing.rs
// Dicom-Sort-rs
//
// Deterministic one-way derivations: patient pseudonyms and replacement UIDs.
//

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use num_bigint::BigUint;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::SetupError;

/// Width of generated patient pseudonyms.
pub const PSEUDONYM_LENGTH: usize = 8;
/// Maximum length of a UI value.
pub const UID_MAX_LENGTH: usize = 64;
const UID_ROOT_MAX_LENGTH: usize = 32;
/// Root for UIDs derived from a large integer (ISO/IEC 9834-8).
pub const UID_ROOT_DEFAULT: &str = "2.25";

static UID_ROOT_REGEX: OnceLock<Regex> = OnceLock::new();

/// Deterministic pseudonym: the first [`PSEUDONYM_LENGTH`] hex characters of SHA-256.
pub fn pseudonym(original: &str) -> String {
    let digest = Sha256::digest(original.as_bytes());
    hex::encode(digest)[..PSEUDONYM_LENGTH].to_string()
}

/// Prefix under which replacement UIDs are generated.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UidRoot(String);

impl UidRoot {
    pub fn new(root: &str) -> Result<Self, SetupError> {
        let regex = UID_ROOT_REGEX.get_or_init(|| {
            Regex::new(&format!(r"^[1-9][0-9.]{{0,{}}}$", UID_ROOT_MAX_LENGTH - 1))
                .expect("valid UID root regex")
        });
        let root = root.trim().trim_end_matches('.');
        if !regex.is_match(root) || root.contains("..") {
            return Err(SetupError::InvalidUidRoot(root.to_string()));
        }
        Ok(Self(root.to_string()))
    }

    /// Derive a syntactically valid UID: `<root>.<decimal SHA-256 of original>`, capped at 64 characters.
    pub fn derive(&self, original: &str) -> String {
        let digest = Sha256::digest(original.as_bytes());
        let number = BigUint::from_bytes_be(&digest).to_string();
        let mut uid = format!("{}.{}", self.0, number);
        uid.truncate(UID_MAX_LENGTH);
        uid
    }
}

impl Default for UidRoot {
    fn default() -> Self {
        Self(UID_ROOT_DEFAULT.to_string())
    }
}

impl FromStr for UidRoot {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UidRoot::new(s)
    }
}

impl fmt::Display for UidRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudonym_is_stable_and_fixed_width() {
        let a = pseudonym("PAT123");
        assert_eq!(a, pseudonym("PAT123"));
        assert_eq!(a.len(), PSEUDONYM_LENGTH);
        assert_ne!(a, pseudonym("PAT124"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derived_uid_is_valid_and_capped() {
        let root = UidRoot::default();
        let uid = root.derive("1.2.840.113619.2.55.3.604688119");
        assert!(uid.starts_with("2.25."));
        assert_eq!(uid.len(), UID_MAX_LENGTH);
        assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
        assert!(!uid.ends_with('.'));
        // no component after the root may start with a zero
        let tail = &uid["2.25.".len()..];
        assert!(!tail.starts_with('0'));
        assert_eq!(uid, root.derive("1.2.840.113619.2.55.3.604688119"));
    }

    #[test]
    fn uid_root_validation() {
        assert!(UidRoot::new("1.2.826.0.1").is_ok());
        assert_eq!(UidRoot::new("9999.").expect("root").to_string(), "9999");
        assert!(UidRoot::new("0.1.2").is_err());
        assert!(UidRoot::new("1..2").is_err());
        assert!(UidRoot::new("abc").is_err());
        assert!(UidRoot::new("").is_err());
    }
}
