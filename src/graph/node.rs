//! Dependency-graph nodes and tasks.
//!
//! A [`Node`] is one cacheable output slot: a mapping from input names to parent nodes, an
//! [`Op`], and the output location it reads from the op's results. A [`Task`] groups sibling
//! nodes that share inputs and op and differ only by output location; running any sibling's
//! calc captures every sibling output at once.
//!
//! Nodes are cheap to clone (`Arc`) and compare by a structural id, so equality and hashing
//! never depend on the order inputs were supplied in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::calc::Calc;
use crate::error::{GraphError, TreeError};
use crate::graph::Op;
use crate::tree::{Digest, DigestBuilder, Name, Path, Tree};

#[derive(Clone)]
pub struct Node(Arc<NodeData>);

struct NodeData {
    id: Digest,
    inputs: BTreeMap<Name, Node>,
    op: Op,
    output: Path,
    levels: Vec<Name>,
    siblings: BTreeSet<Path>,
}

/// Covers everything `calc` reads, so equal nodes always resolve to the same calc.
fn node_id(
    inputs: &BTreeMap<Name, Node>,
    op: &Op,
    output: &Path,
    levels: &[Name],
    siblings: &BTreeSet<Path>,
) -> Digest {
    let mut b = DigestBuilder::new("node");
    b.field(&inputs.len().to_string());
    for (name, parent) in inputs {
        b.field(name.as_str()).field(parent.id().as_str());
    }
    op.feed(&mut b);
    b.field(&output.to_string());
    b.field(&levels.len().to_string());
    for level in levels {
        b.field(level.as_str());
    }
    b.field(&siblings.len().to_string());
    for sibling in siblings {
        b.field(&sibling.to_string());
    }
    b.finish()
}

impl Node {
    /// A node whose task has this single output.
    pub fn new(inputs: BTreeMap<Name, Node>, op: Op, output: Path) -> Self {
        let siblings = BTreeSet::from([output.clone()]);
        Node::build(inputs, op, output, Vec::new(), siblings)
    }

    fn build(
        inputs: BTreeMap<Name, Node>,
        op: Op,
        output: Path,
        levels: Vec<Name>,
        siblings: BTreeSet<Path>,
    ) -> Self {
        Node(Arc::new(NodeData {
            id: node_id(&inputs, &op, &output, &levels, &siblings),
            inputs,
            op,
            output,
            levels,
            siblings,
        }))
    }

    pub fn id(&self) -> &Digest {
        &self.0.id
    }

    pub fn inputs(&self) -> &BTreeMap<Name, Node> {
        &self.0.inputs
    }

    pub fn op(&self) -> &Op {
        &self.0.op
    }

    pub fn output(&self) -> &Path {
        &self.0.output
    }

    /// Nesting levels declared on the result, outermost first.
    pub fn levels(&self) -> &[Name] {
        &self.0.levels
    }

    /// Output locations of every node sharing this node's execution.
    pub fn siblings(&self) -> &BTreeSet<Path> {
        &self.0.siblings
    }

    /// The same execution, read at another of its outputs.
    pub fn sibling(&self, output: &Path) -> Result<Node, GraphError> {
        if !self.0.siblings.contains(output) {
            return Err(GraphError::UnknownOutput {
                output: output.to_string(),
            });
        }
        Ok(Node::build(
            self.0.inputs.clone(),
            self.0.op.clone(),
            output.clone(),
            self.0.levels.clone(),
            self.0.siblings.clone(),
        ))
    }

    /// Distinct nodes referenced by the inputs.
    pub fn parents(&self) -> BTreeSet<Node> {
        self.0.inputs.values().cloned().collect()
    }

    /// Declare that the result is a keyed collection one level deeper.
    pub fn descend(&self, level: Name) -> Result<Node, GraphError> {
        let levels = push_level(&self.0.levels, level)?;
        Ok(Node::build(
            self.0.inputs.clone(),
            self.0.op.clone(),
            self.0.output.clone(),
            levels,
            self.0.siblings.clone(),
        ))
    }

    /// Remove the innermost declared level.
    pub fn ascend(&self) -> Result<Node, GraphError> {
        let levels = pop_level(&self.0.levels)?;
        Ok(Node::build(
            self.0.inputs.clone(),
            self.0.op.clone(),
            self.0.output.clone(),
            levels,
            self.0.siblings.clone(),
        ))
    }

    /// Resolve this node into a calc, given a lookup of its parents' results.
    ///
    /// The calc requests every sibling output so one execution serves the whole task.
    pub fn calc<'a>(
        &self,
        mut result_of: impl FnMut(&Node) -> Option<&'a Tree>,
    ) -> Result<Calc, GraphError> {
        let mut inputs = BTreeMap::new();
        for (name, parent) in &self.0.inputs {
            let tree = result_of(parent).ok_or_else(|| GraphError::MissingInput {
                input: name.to_string(),
            })?;
            inputs.insert(name.clone(), tree.clone());
        }
        Ok(Calc::new(inputs, self.0.op.clone(), self.0.siblings.clone()))
    }

    /// This node's slice of a calc result, checked against the declared nesting.
    pub fn result_from(&self, calc_result: &Tree) -> Result<Tree, TreeError> {
        let mine = calc_result.pick(&self.0.output)?;
        mine.iter_level(self.0.levels.len())?;
        Ok(mine.clone())
    }

    /// Items of a nested result, keyed by their path through the declared levels.
    pub fn items<'t>(&self, result: &'t Tree) -> Result<Vec<(Path, &'t Tree)>, TreeError> {
        result.iter_level(self.0.levels.len())
    }
}

fn push_level(levels: &[Name], level: Name) -> Result<Vec<Name>, GraphError> {
    if levels.contains(&level) {
        return Err(GraphError::DuplicateLevel {
            level: level.to_string(),
        });
    }
    let mut out = levels.to_vec();
    out.push(level);
    Ok(out)
}

fn pop_level(levels: &[Name]) -> Result<Vec<Name>, GraphError> {
    match levels.split_last() {
        Some((_, rest)) => Ok(rest.to_vec()),
        None => Err(GraphError::NoLevel),
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({} {}@{})", self.0.id.short(), self.0.op, self.0.output)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.0.op, self.0.output)
    }
}

/// Sibling outputs sharing one op execution and input set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    inputs: BTreeMap<Name, Node>,
    op: Op,
    outputs: BTreeSet<Path>,
    levels: Vec<Name>,
}

impl Task {
    /// Outputs must be non-empty and none may contain another.
    pub fn new(
        inputs: BTreeMap<Name, Node>,
        op: Op,
        outputs: impl IntoIterator<Item = Path>,
    ) -> Result<Self, GraphError> {
        let outputs: BTreeSet<Path> = outputs.into_iter().collect();
        if outputs.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        for outer in &outputs {
            if let Some(inner) = outputs
                .iter()
                .find(|inner| *inner != outer && inner.starts_with(outer))
            {
                return Err(GraphError::OverlappingOutputs {
                    outer: outer.to_string(),
                    inner: inner.to_string(),
                });
            }
        }
        Ok(Task {
            inputs,
            op,
            outputs,
            levels: Vec::new(),
        })
    }

    pub fn outputs(&self) -> &BTreeSet<Path> {
        &self.outputs
    }

    pub fn node(&self, output: &Path) -> Result<Node, GraphError> {
        if !self.outputs.contains(output) {
            return Err(GraphError::UnknownOutput {
                output: output.to_string(),
            });
        }
        Ok(Node::build(
            self.inputs.clone(),
            self.op.clone(),
            output.clone(),
            self.levels.clone(),
            self.outputs.clone(),
        ))
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.outputs
            .iter()
            .map(|output| {
                Node::build(
                    self.inputs.clone(),
                    self.op.clone(),
                    output.clone(),
                    self.levels.clone(),
                    self.outputs.clone(),
                )
            })
            .collect()
    }

    /// Declare one more nesting level on every output.
    pub fn descend(&self, level: Name) -> Result<Task, GraphError> {
        Ok(Task {
            levels: push_level(&self.levels, level)?,
            ..self.clone()
        })
    }

    pub fn ascend(&self) -> Result<Task, GraphError> {
        Ok(Task {
            levels: pop_level(&self.levels)?,
            ..self.clone()
        })
    }
}

/// Distinct nodes referenced by `node`'s inputs.
pub fn parents(node: &Node) -> BTreeSet<Node> {
    node.parents()
}

/// `requested` plus every ancestor, by iterative frontier expansion.
///
/// Shared ancestors (diamonds) are visited once.
pub fn get_nodes_and_ancestors<'a>(requested: impl IntoIterator<Item = &'a Node>) -> BTreeSet<Node> {
    let mut seen: BTreeSet<Node> = BTreeSet::new();
    let mut frontier: Vec<Node> = requested.into_iter().cloned().collect();
    while let Some(node) = frontier.pop() {
        if !seen.insert(node.clone()) {
            continue;
        }
        frontier.extend(
            node.inputs()
                .values()
                .filter(|parent| !seen.contains(*parent))
                .cloned(),
        );
    }
    seen
}

/// Parentless nodes among `requested` and its ancestors.
pub fn get_root_nodes<'a>(requested: impl IntoIterator<Item = &'a Node>) -> BTreeSet<Node> {
    get_nodes_and_ancestors(requested)
        .into_iter()
        .filter(|node| node.inputs().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn n(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn text(t: &str) -> Node {
        Node::new(BTreeMap::new(), Op::write("out", t), p("out"))
    }

    #[test]
    fn identity_is_structural() {
        let a = text("a");
        let b = text("b");
        let x = Node::new(
            BTreeMap::from([(n("l"), a.clone()), (n("r"), b.clone())]),
            Op::concat(&["l", "r"], "out"),
            p("out"),
        );
        let y = Node::new(
            [(n("r"), b.clone()), (n("l"), a.clone())].into_iter().collect(),
            Op::concat(&["l", "r"], "out"),
            p("out"),
        );
        assert_eq!(x, y);
        assert_eq!(x.id(), y.id());
        assert_ne!(x, Node::new(x.inputs().clone(), x.op().clone(), p("other")));
        assert_eq!(x.parents(), BTreeSet::from([a, b]));
    }

    #[test]
    fn parents_are_distinct() {
        let a = text("a");
        let twice = Node::new(
            BTreeMap::from([(n("l"), a.clone()), (n("r"), a.clone())]),
            Op::concat(&["l", "r"], "out"),
            p("out"),
        );
        assert_eq!(parents(&twice), BTreeSet::from([a]));
    }

    #[test]
    fn ancestors_visit_diamonds_once() {
        let root = text("root");
        let left = Node::new(BTreeMap::from([(n("i"), root.clone())]), Op::shell("l"), p("o"));
        let right = Node::new(BTreeMap::from([(n("i"), root.clone())]), Op::shell("r"), p("o"));
        let join = Node::new(
            BTreeMap::from([(n("a"), left.clone()), (n("b"), right.clone())]),
            Op::shell("j"),
            p("o"),
        );
        let all = get_nodes_and_ancestors([&join]);
        assert_eq!(all, BTreeSet::from([root.clone(), left, right, join.clone()]));
        assert_eq!(get_root_nodes([&join]), BTreeSet::from([root]));
    }

    #[test]
    fn task_siblings_share_execution() {
        let task = Task::new(BTreeMap::new(), Op::shell("split"), [p("a"), p("b")]).unwrap();
        let a = task.node(&p("a")).unwrap();
        let b = task.node(&p("b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.siblings(), b.siblings());
        assert_eq!(a.sibling(&p("b")).unwrap(), b);
        assert_eq!(task.nodes(), vec![a.clone(), b]);
        assert!(matches!(task.node(&p("c")), Err(GraphError::UnknownOutput { .. })));

        let calc = a.calc(|_| None).unwrap();
        assert_eq!(calc.outputs(), &BTreeSet::from([p("a"), p("b")]));
    }

    #[test]
    fn equal_nodes_resolve_to_equal_calcs() {
        let op = Op::write("a", "x");
        let alone = Node::new(BTreeMap::new(), op.clone(), p("a"));
        let paired = Task::new(BTreeMap::new(), op.clone(), [p("a"), p("b")])
            .unwrap()
            .node(&p("a"))
            .unwrap();
        assert_ne!(alone, paired);
        assert_ne!(
            alone.calc(|_| None).unwrap().digest(),
            paired.calc(|_| None).unwrap().digest()
        );

        let again = Task::new(BTreeMap::new(), op, [p("a")]).unwrap().node(&p("a")).unwrap();
        assert_eq!(alone, again);
        assert_eq!(
            alone.calc(|_| None).unwrap().digest(),
            again.calc(|_| None).unwrap().digest()
        );
        assert_eq!(BTreeSet::from([alone, paired, again]).len(), 2);
    }

    #[test]
    fn task_rejects_overlapping_outputs() {
        assert_eq!(
            Task::new(BTreeMap::new(), Op::shell("x"), [p("a"), p("a/b")]),
            Err(GraphError::OverlappingOutputs {
                outer: "a".to_string(),
                inner: "a/b".to_string()
            })
        );
        assert_eq!(
            Task::new(BTreeMap::new(), Op::shell("x"), Vec::new()),
            Err(GraphError::NoOutputs)
        );
    }

    #[test]
    fn descend_and_ascend() {
        let base = text("x");
        let deep = base.descend(n("item")).unwrap();
        assert_ne!(deep, base);
        assert_eq!(deep.levels(), &[n("item")]);
        assert_eq!(
            deep.descend(n("item")),
            Err(GraphError::DuplicateLevel {
                level: "item".to_string()
            })
        );
        assert_eq!(deep.ascend().unwrap(), base);
        assert_eq!(base.ascend(), Err(GraphError::NoLevel));

        let task = Task::new(BTreeMap::new(), Op::shell("x"), [p("a")])
            .unwrap()
            .descend(n("k"))
            .unwrap();
        assert_eq!(task.node(&p("a")).unwrap().levels(), &[n("k")]);
        assert!(task.ascend().unwrap().ascend().is_err());
    }

    #[test]
    fn nested_results_are_checked() {
        let node = text("x").descend(n("item")).unwrap();
        let leaf = |s: &str| Tree::leaf(Digest::of_bytes(s.as_bytes()));
        let good = Tree::from_entries([(p("out/one"), leaf("1")), (p("out/two"), leaf("2"))]).unwrap();
        let mine = node.result_from(&good).unwrap();
        let keys: Vec<String> = node
            .items(&mine)
            .unwrap()
            .into_iter()
            .map(|(path, _)| path.to_string())
            .collect();
        assert_eq!(keys, vec!["one", "two"]);

        let flat = Tree::nest(&p("out"), leaf("1"));
        assert!(matches!(
            node.result_from(&flat),
            Err(TreeError::LevelMismatch { .. })
        ));
    }

    #[test]
    fn calc_requires_parent_results() {
        let a = text("a");
        let child = Node::new(BTreeMap::from([(n("in"), a.clone())]), Op::shell("cat in"), p("o"));
        assert_eq!(
            child.calc(|_| None),
            Err(GraphError::MissingInput {
                input: "in".to_string()
            })
        );
        let value = Tree::leaf(Digest::of_bytes(b"a"));
        let calc = child.calc(|node| (node == &a).then_some(&value)).unwrap();
        assert_eq!(calc.inputs().get(&n("in")), Some(&value));
    }
}
