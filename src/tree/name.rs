//! Names and paths addressing locations inside a [`super::Tree`].
//!
//! A path is stored as a `Vec<Name>` with derived ordering so it can key `BTreeSet`/`BTreeMap`.
//! Its text form uses `/` separators; the root path renders as `.`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TreeError;

pub const SEPARATOR: char = '/';

/// One non-empty path segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(String);

impl Name {
    pub fn new(raw: impl Into<String>) -> Result<Self, TreeError> {
        let raw = raw.into();
        let reason = if raw.is_empty() {
            Some("empty")
        } else if raw == "." || raw == ".." {
            Some("reserved")
        } else if raw.contains(SEPARATOR) {
            Some("contains a separator")
        } else if raw.contains('\0') {
            Some("contains NUL")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(TreeError::InvalidName { raw, reason }),
            None => Ok(Name(raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Name {
    type Error = TreeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Name::new(value)
    }
}

impl From<Name> for String {
    fn from(name: Name) -> Self {
        name.0
    }
}

impl FromStr for Name {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::new(s)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Relative location inside a tree; empty means the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path(Vec<Name>);

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn new(names: Vec<Name>) -> Self {
        Path(names)
    }

    /// Parse the `/`-separated text form.
    ///
    /// `.` segments and trailing separators are dropped; empty input, absolute paths and
    /// empty interior segments are rejected.
    pub fn parse(raw: &str) -> Result<Self, TreeError> {
        let invalid = |reason: String| TreeError::InvalidPath {
            raw: raw.to_string(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("empty".to_string()));
        }
        if raw.starts_with(SEPARATOR) {
            return Err(invalid("absolute".to_string()));
        }

        let trimmed = raw.trim_end_matches(SEPARATOR);
        let mut names = Vec::new();
        for segment in trimmed.split(SEPARATOR) {
            match segment {
                "" => return Err(invalid("empty segment".to_string())),
                "." => continue,
                other => names.push(Name::new(other).map_err(|e| invalid(e.to_string()))?),
            }
        }
        Ok(Path(names))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> &[Name] {
        &self.0
    }

    pub fn join(&self, name: &Name) -> Path {
        let mut names = self.0.clone();
        names.push(name.clone());
        Path(names)
    }

    pub fn concat(&self, other: &Path) -> Path {
        let mut names = self.0.clone();
        names.extend(other.0.iter().cloned());
        Path(names)
    }

    /// Split off the last segment.
    pub fn split_last(&self) -> Option<(Path, &Name)> {
        let (last, init) = self.0.split_last()?;
        Some((Path(init.to_vec()), last))
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Native relative path for this location, rooted at `base`.
    pub fn to_fs_path(&self, base: &std::path::Path) -> std::path::PathBuf {
        let mut out = base.to_path_buf();
        for name in &self.0 {
            out.push(name.as_str());
        }
        out
    }
}

impl From<Name> for Path {
    fn from(name: Name) -> Self {
        Path(vec![name])
    }
}

impl TryFrom<String> for Path {
    type Error = TreeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Path::parse(&value)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

impl FromStr for Path {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(".");
        }
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            f.write_str(name.as_str())?;
        }
        Ok(())
    }
}
