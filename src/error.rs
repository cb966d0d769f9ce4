//! Error kinds surfaced by the engine.
//!
//! Each seam has its own enum so callers can match on what they can act on. The make driver
//! folds them into [`Error`].

use std::path::PathBuf;

use thiserror::Error;

use crate::tree::Digest;

/// Malformed identifiers and incompatible tree operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("name `{raw}` is invalid: {reason}")]
    InvalidName { raw: String, reason: &'static str },
    #[error("path `{raw}` is invalid: {reason}")]
    InvalidPath { raw: String, reason: String },
    #[error("digest `{raw}` is invalid: expected 64 lowercase hex characters")]
    InvalidDigest { raw: String },
    #[error("trees collide at `{path}`")]
    Collision { path: String },
    #[error("no entry `{name}` under `{path}`")]
    Missing { path: String, name: String },
    #[error("path runs past a leaf at `{path}`")]
    PastLeaf { path: String },
    #[error("expected a subtree at `{path}` (level {level} of {depth}), found a leaf")]
    LevelMismatch {
        path: String,
        level: usize,
        depth: usize,
    },
}

/// Dependency-graph construction errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("level `{level}` is already declared on this node")]
    DuplicateLevel { level: String },
    #[error("no nesting level to remove")]
    NoLevel,
    #[error("`{output}` is not an output of this task")]
    UnknownOutput { output: String },
    #[error("task outputs `{outer}` and `{inner}` overlap")]
    OverlappingOutputs { outer: String, inner: String },
    #[error("task declares no outputs")]
    NoOutputs,
    #[error("no result available for input `{input}`")]
    MissingInput { input: String },
}

/// Scheduler transition errors. Both indicate a driver bug, never a data problem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("precondition failed for node {node}: {reason}")]
    Precondition { node: String, reason: &'static str },
    #[error("node {node} already has result {existing}, refusing {offered}")]
    Conflict {
        node: String,
        existing: String,
        offered: String,
    },
    #[error("graph state invariant violated: {0}")]
    Invariant(String),
}

/// Content store errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("walking {path:?}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("unsupported file type at {path:?}")]
    UnsupportedFile { path: PathBuf },
    #[error("cannot restore: blob {digest} {reason}")]
    Restore { digest: Digest, reason: &'static str },
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("stamp for blob {digest} is unreadable: {source}")]
    Stamp {
        digest: Digest,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures raised by an [`crate::env::Env`] backend.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("sandbox io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown sandbox {0}")]
    UnknownSandbox(u64),
    #[error("unsupported op kind `{0}`")]
    UnsupportedOp(String),
    #[error("op parameter `{0}` is missing")]
    MissingParam(&'static str),
    #[error("op failed: {0}")]
    OpFailed(String),
    #[error("nothing at `{0}` in the sandbox")]
    NothingToStow(String),
}

/// An op failed while executing a calc. The sandbox was torn down regardless.
#[derive(Debug, Error)]
#[error("calc {calc} failed: {message}")]
pub struct RunError {
    pub calc: Digest,
    pub message: String,
    #[source]
    pub source: EnvError,
}

/// Provenance log errors.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("log row does not decode: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("log connection lock poisoned")]
    Poisoned,
    #[error("calc {calc} has {} conflicting trusted results: {}", candidates.len(), render_digests(candidates))]
    Conflict {
        calc: Digest,
        candidates: Vec<Digest>,
    },
}

fn render_digests(digests: &[Digest]) -> String {
    digests
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("user name `{user}` is invalid (expected letters, digits, `_`, `.`, `@` or `-`)")]
    InvalidUser { user: String },
    #[error(transparent)]
    Regex(#[from] regex::Error),
}

/// Everything the make driver can fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
