//! treemake: an incremental, content-addressed build engine.
//!
//! Values are [`Tree`]s of content digests. A [`Node`] describes how to compute one output
//! from other nodes; [`make()`] drives a [`GraphState`] to completion, reusing earlier results
//! recorded in the provenance [`Log`] and executing the rest in an [`Env`].

pub mod calc;
pub mod config;
pub mod env;
pub mod error;
pub mod graph;
pub mod make;
pub mod provenance;
pub mod spec;
pub mod storage;
pub mod tree;

pub use calc::{Calc, Run};
pub use config::Context;
pub use env::{Env, LocalEnv, MemoryEnv};
pub use error::Error;
pub use graph::{GraphState, Node, Op, Task};
pub use make::{MakeReport, make};
pub use provenance::{Log, Opinion};
pub use storage::Storage;
pub use tree::{Digest, Name, Path, Tree};
