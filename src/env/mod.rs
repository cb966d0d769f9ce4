//! Execution environments.
//!
//! An [`Env`] owns sandboxes and content: it places resolved input trees into an isolated
//! workspace, runs an op there, and captures (stows) outputs as content-addressed trees.
//! [`LocalEnv`] backs this with directories and the on-disk [`crate::storage::Storage`];
//! [`MemoryEnv`] keeps everything in memory and is meant for tests.

pub mod local;
pub mod memory;

pub use local::LocalEnv;
pub use memory::MemoryEnv;

use crate::error::EnvError;
use crate::graph::Op;
use crate::tree::{Name, Path, Tree};

pub trait Env {
    /// Handle to one isolated workspace.
    type Sandbox;

    fn create_sandbox(&mut self) -> Result<Self::Sandbox, EnvError>;

    fn destroy_sandbox(&mut self, sandbox: Self::Sandbox) -> Result<(), EnvError>;

    /// Materialize `tree` at `loc` inside the sandbox.
    fn place(&mut self, sandbox: &Self::Sandbox, loc: &Path, tree: &Tree) -> Result<(), EnvError>;

    fn run_op(&mut self, op: &Op, sandbox: &Self::Sandbox) -> Result<(), EnvError>;

    /// Capture whatever sits at `loc` and make its content restorable.
    fn stow(&mut self, sandbox: &Self::Sandbox, loc: &Path) -> Result<Tree, EnvError>;

    /// Whether every blob `tree` references can be placed right now.
    fn can_restore(&self, tree: &Tree) -> bool;

    /// Hand a requested result to whoever asked for it.
    fn deliver(&mut self, name: &Name, tree: &Tree) -> Result<(), EnvError>;
}
