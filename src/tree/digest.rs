//! Content fingerprints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::TreeError;

/// Lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Digest(hex::encode(Sha256::digest(bytes)))
    }

    pub fn parse(raw: &str) -> Result<Self, TreeError> {
        let well_formed = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(TreeError::InvalidDigest {
                raw: raw.to_string(),
            });
        }
        Ok(Digest(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

/// Incremental digest over a sequence of length-prefixed fields.
///
/// Used for structural identities (trees, nodes, calcs) so that two different field sequences
/// can never encode to the same byte stream.
#[derive(Debug, Clone, Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = DigestBuilder::default();
        builder.field(domain);
        builder
    }

    pub fn field(&mut self, value: &str) -> &mut Self {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn finish(self) -> Digest {
        Digest(hex::encode(self.hasher.finalize()))
    }
}

impl TryFrom<String> for Digest {
    type Error = TreeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl FromStr for Digest {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn known_sha256() {
        assert_eq!(
            Digest::of_bytes(b"hello").as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn parse_validates_shape() {
        let d = Digest::of_bytes(b"x");
        assert_eq!(Digest::parse(d.as_str()), Ok(d.clone()));
        assert!(Digest::parse("abc").is_err());
        assert!(Digest::parse(&d.as_str().to_uppercase()).is_err());
        assert_eq!(d.short().len(), 12);
    }

    #[test]
    fn builder_fields_are_unambiguous() {
        let mut ab = DigestBuilder::new("t");
        ab.field("ab").field("c");
        let mut a_bc = DigestBuilder::new("t");
        a_bc.field("a").field("bc");
        assert_ne!(ab.finish(), a_bc.finish());
    }
}
