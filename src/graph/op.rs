//! Opaque computation descriptors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tree::DigestBuilder;

/// What to run. The engine only compares and hashes ops; an [`crate::env::Env`] interprets
/// `kind` and `params`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Op {
    kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, String>,
}

impl Op {
    pub fn new(kind: impl Into<String>) -> Self {
        Op {
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// A shell command run with the sandbox as working directory.
    pub fn shell(cmd: impl Into<String>) -> Self {
        Op::new("shell").with("cmd", cmd)
    }

    /// Write literal `text` to `path` inside the sandbox.
    pub fn write(path: impl Into<String>, text: impl Into<String>) -> Self {
        Op::new("write").with("path", path).with("text", text)
    }

    /// Concatenate the comma-separated `inputs` files into `path`.
    pub fn concat(inputs: &[&str], path: impl Into<String>) -> Self {
        Op::new("concat")
            .with("inputs", inputs.join(","))
            .with("path", path)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub(crate) fn feed(&self, builder: &mut DigestBuilder) {
        builder
            .field(&self.kind)
            .field(&self.params.len().to_string());
        for (k, v) in &self.params {
            builder.field(k).field(v);
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(cmd) = self.param("cmd") {
            write!(f, "({cmd})")?;
        }
        Ok(())
    }
}
