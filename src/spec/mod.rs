//! Spec layer: the graph file schema and its validated in-memory form.

pub mod graph;

pub use graph::{GraphSpec, RawTask, TaskRef, ValidatedGraph};
