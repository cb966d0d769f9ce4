//! Dependency graph: nodes, tasks, and the scheduling state machine.

pub mod node;
pub mod op;
pub mod state;

pub use node::{Node, Task, get_nodes_and_ancestors, get_root_nodes, parents};
pub use op::Op;
pub use state::GraphState;
