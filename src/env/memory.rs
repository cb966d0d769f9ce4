//! In-memory environment double.

use std::collections::{BTreeMap, HashMap};

use crate::env::Env;
use crate::error::{EnvError, StorageError};
use crate::graph::Op;
use crate::tree::{Digest, Name, Path, Tree};

type Files = BTreeMap<Path, Vec<u8>>;

/// Sandboxes are maps of file paths to bytes; content lives in a shared blob map.
///
/// Understands the `write` and `concat` op kinds and counts every op it runs.
#[derive(Debug, Default)]
pub struct MemoryEnv {
    blobs: HashMap<Digest, Vec<u8>>,
    sandboxes: BTreeMap<u64, Files>,
    next_sandbox: u64,
    executions: usize,
    delivered: BTreeMap<Name, Tree>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executions(&self) -> usize {
        self.executions
    }

    pub fn live_sandboxes(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn content(&self, digest: &Digest) -> Option<&[u8]> {
        self.blobs.get(digest).map(Vec::as_slice)
    }

    pub fn delivered(&self) -> &BTreeMap<Name, Tree> {
        &self.delivered
    }

    /// Drop a blob, as if it had been lost from storage.
    pub fn forget(&mut self, digest: &Digest) {
        self.blobs.remove(digest);
    }

    fn files(&mut self, sandbox: &u64) -> Result<&mut Files, EnvError> {
        self.sandboxes
            .get_mut(sandbox)
            .ok_or(EnvError::UnknownSandbox(*sandbox))
    }
}

fn param<'a>(op: &'a Op, key: &'static str) -> Result<&'a str, EnvError> {
    op.param(key).ok_or(EnvError::MissingParam(key))
}

impl Env for MemoryEnv {
    type Sandbox = u64;

    fn create_sandbox(&mut self) -> Result<u64, EnvError> {
        let id = self.next_sandbox;
        self.next_sandbox += 1;
        self.sandboxes.insert(id, Files::new());
        Ok(id)
    }

    fn destroy_sandbox(&mut self, sandbox: u64) -> Result<(), EnvError> {
        self.sandboxes
            .remove(&sandbox)
            .map(|_| ())
            .ok_or(EnvError::UnknownSandbox(sandbox))
    }

    fn place(&mut self, sandbox: &u64, loc: &Path, tree: &Tree) -> Result<(), EnvError> {
        let mut placed = Vec::new();
        for (path, node) in tree.walk() {
            if let Tree::Leaf(digest) = node {
                let bytes = self.blobs.get(digest).ok_or_else(|| StorageError::Restore {
                    digest: digest.clone(),
                    reason: "is missing",
                })?;
                placed.push((loc.concat(&path), bytes.clone()));
            }
        }
        self.files(sandbox)?.extend(placed);
        Ok(())
    }

    fn run_op(&mut self, op: &Op, sandbox: &u64) -> Result<(), EnvError> {
        self.executions += 1;
        log::debug!("memory env running {op} in sandbox {sandbox}");
        let files = self.files(sandbox)?;
        match op.kind() {
            "write" => {
                let path = Path::parse(param(op, "path")?)?;
                files.insert(path, param(op, "text")?.as_bytes().to_vec());
            }
            "concat" => {
                let mut out = Vec::new();
                for input in param(op, "inputs")?.split(',') {
                    let input = Path::parse(input.trim())?;
                    let bytes = files
                        .get(&input)
                        .ok_or_else(|| EnvError::OpFailed(format!("no input file `{input}`")))?;
                    out.extend_from_slice(bytes);
                }
                files.insert(Path::parse(param(op, "path")?)?, out);
            }
            other => return Err(EnvError::UnsupportedOp(other.to_string())),
        }
        Ok(())
    }

    fn stow(&mut self, sandbox: &u64, loc: &Path) -> Result<Tree, EnvError> {
        let mut entries = Vec::new();
        for (path, bytes) in self.files(sandbox)?.iter() {
            if !path.starts_with(loc) {
                continue;
            }
            let relative = Path::new(path.names()[loc.len()..].to_vec());
            entries.push((relative, bytes.clone()));
        }
        if entries.is_empty() {
            return Err(EnvError::NothingToStow(loc.to_string()));
        }

        let mut leaves = Vec::with_capacity(entries.len());
        for (relative, bytes) in entries {
            let digest = Digest::of_bytes(&bytes);
            self.blobs.entry(digest.clone()).or_insert(bytes);
            leaves.push((relative, Tree::leaf(digest)));
        }
        Ok(Tree::from_entries(leaves)?)
    }

    fn can_restore(&self, tree: &Tree) -> bool {
        tree.leaves().into_iter().all(|d| self.blobs.contains_key(d))
    }

    fn deliver(&mut self, name: &Name, tree: &Tree) -> Result<(), EnvError> {
        self.delivered.insert(name.clone(), tree.clone());
        Ok(())
    }
}
