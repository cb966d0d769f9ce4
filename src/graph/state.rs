//! Immutable scheduling state.
//!
//! A [`GraphState`] tracks, for every node needed by a request, what is known about it:
//!
//! - `known`: nodes with a recorded result tree
//! - `parents_known`: nodes whose parents are all known (their calc can be looked up)
//! - `restorable`: known nodes whose content can be placed right now
//! - `runnable`: nodes whose parents are all restorable (their calc can be executed)
//! - `priority_work`: the runnable nodes the driver should act on next
//!
//! Transitions return a new state and leave the old one untouched, so sequences can be
//! branched and replayed freely. Sets only ever grow.
//!
//! ## Priority policy
//!
//! Nothing is scheduled once every requested node is restorable. Otherwise the first
//! non-empty tier wins:
//! 1. runnable nodes whose result is unknown
//! 2. requested nodes that are runnable but not restorable
//! 3. any runnable node that is not restorable
//!
//! Each acted-on node either becomes known or becomes restorable, so on an acyclic graph the
//! loop ends after at most `2 * all_nodes.len()` steps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::StateError;
use crate::graph::Node;
use crate::graph::node::get_nodes_and_ancestors;
use crate::tree::Tree;

#[derive(Debug, PartialEq)]
struct Topology {
    all_nodes: BTreeSet<Node>,
    children: BTreeMap<Node, BTreeSet<Node>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphState {
    topology: Arc<Topology>,
    requested: BTreeSet<Node>,
    known: BTreeSet<Node>,
    parents_known: BTreeSet<Node>,
    restorable: BTreeSet<Node>,
    runnable: BTreeSet<Node>,
    priority_work: BTreeSet<Node>,
    results: BTreeMap<Node, Tree>,
}

impl GraphState {
    pub fn from_requested(requested: impl IntoIterator<Item = Node>) -> Self {
        let requested: BTreeSet<Node> = requested.into_iter().collect();
        let all_nodes = get_nodes_and_ancestors(&requested);

        let mut children: BTreeMap<Node, BTreeSet<Node>> = BTreeMap::new();
        for node in &all_nodes {
            for parent in node.parents() {
                children.entry(parent).or_default().insert(node.clone());
            }
        }

        let roots: BTreeSet<Node> = all_nodes
            .iter()
            .filter(|node| node.inputs().is_empty())
            .cloned()
            .collect();

        let mut state = GraphState {
            topology: Arc::new(Topology {
                all_nodes,
                children,
            }),
            requested,
            known: BTreeSet::new(),
            parents_known: roots.clone(),
            restorable: BTreeSet::new(),
            runnable: roots,
            priority_work: BTreeSet::new(),
            results: BTreeMap::new(),
        };
        state.priority_work = state.compute_priority_work();
        state
    }

    pub fn all_nodes(&self) -> &BTreeSet<Node> {
        &self.topology.all_nodes
    }

    pub fn requested(&self) -> &BTreeSet<Node> {
        &self.requested
    }

    pub fn known(&self) -> &BTreeSet<Node> {
        &self.known
    }

    pub fn parents_known(&self) -> &BTreeSet<Node> {
        &self.parents_known
    }

    pub fn restorable(&self) -> &BTreeSet<Node> {
        &self.restorable
    }

    pub fn runnable(&self) -> &BTreeSet<Node> {
        &self.runnable
    }

    pub fn priority_work(&self) -> &BTreeSet<Node> {
        &self.priority_work
    }

    pub fn results(&self) -> &BTreeMap<Node, Tree> {
        &self.results
    }

    pub fn result(&self, node: &Node) -> Option<&Tree> {
        self.results.get(node)
    }

    /// Every requested node is restorable.
    pub fn is_done(&self) -> bool {
        self.requested.is_subset(&self.restorable)
    }

    /// Record result trees. Repeating an identical result is a no-op.
    pub fn add_results(
        &self,
        results: impl IntoIterator<Item = (Node, Tree)>,
    ) -> Result<GraphState, StateError> {
        let mut next = self.clone();
        let mut fresh = Vec::new();
        for (node, tree) in results {
            if !self.parents_known.contains(&node) {
                return Err(precondition(&node, self.missing_reason(&node, "parents are not all known")));
            }
            match next.results.get(&node) {
                Some(existing) if existing != &tree => {
                    return Err(StateError::Conflict {
                        node: node.to_string(),
                        existing: existing.digest().to_string(),
                        offered: tree.digest().to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    next.results.insert(node.clone(), tree);
                    next.known.insert(node.clone());
                    fresh.push(node);
                }
            }
        }

        for node in fresh {
            for child in next.children_of(&node) {
                if child.parents().is_subset(&next.known) {
                    next.parents_known.insert(child.clone());
                }
            }
        }
        next.priority_work = next.compute_priority_work();
        Ok(next)
    }

    /// Mark known results as restorable.
    pub fn add_restorable(
        &self,
        nodes: impl IntoIterator<Item = Node>,
    ) -> Result<GraphState, StateError> {
        let mut next = self.clone();
        let mut fresh = Vec::new();
        for node in nodes {
            if !self.known.contains(&node) {
                return Err(precondition(&node, self.missing_reason(&node, "result is not known")));
            }
            if next.restorable.insert(node.clone()) {
                fresh.push(node);
            }
        }

        for node in fresh {
            for child in next.children_of(&node) {
                if child.parents().is_subset(&next.restorable) {
                    next.runnable.insert(child.clone());
                }
            }
        }
        next.priority_work = next.compute_priority_work();
        Ok(next)
    }

    fn children_of(&self, node: &Node) -> Vec<Node> {
        self.topology
            .children
            .get(node)
            .map(|kids| kids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn missing_reason(&self, node: &Node, otherwise: &'static str) -> &'static str {
        if self.topology.all_nodes.contains(node) {
            otherwise
        } else {
            "not part of this graph"
        }
    }

    fn compute_priority_work(&self) -> BTreeSet<Node> {
        if self.is_done() {
            return BTreeSet::new();
        }

        let unknown: BTreeSet<Node> = self.runnable.difference(&self.known).cloned().collect();
        if !unknown.is_empty() {
            return unknown;
        }

        let unrestorable: BTreeSet<Node> =
            self.runnable.difference(&self.restorable).cloned().collect();
        let requested: BTreeSet<Node> = unrestorable.intersection(&self.requested).cloned().collect();
        if !requested.is_empty() {
            return requested;
        }
        unrestorable
    }

    /// Check every structural invariant; used by tests and debug assertions in drivers.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let fail = |what: &str| Err(StateError::Invariant(what.to_string()));
        let all = &self.topology.all_nodes;

        if &get_nodes_and_ancestors(&self.requested) != all {
            return fail("all_nodes is not the closure of requested");
        }
        let with_results: BTreeSet<Node> = self.results.keys().cloned().collect();
        if with_results != self.known {
            return fail("known differs from nodes with results");
        }
        if !self.restorable.is_subset(&self.known) {
            return fail("restorable is not a subset of known");
        }
        if !self.known.is_subset(&self.parents_known) {
            return fail("known is not a subset of parents_known");
        }
        let expect_parents_known: BTreeSet<Node> = all
            .iter()
            .filter(|n| n.parents().is_subset(&self.known))
            .cloned()
            .collect();
        if expect_parents_known != self.parents_known {
            return fail("parents_known does not match known parents");
        }
        let expect_runnable: BTreeSet<Node> = all
            .iter()
            .filter(|n| n.parents().is_subset(&self.restorable))
            .cloned()
            .collect();
        if expect_runnable != self.runnable {
            return fail("runnable does not match restorable parents");
        }
        if !all.is_empty() && self.runnable.is_empty() {
            return fail("runnable is empty on a non-empty graph");
        }
        if self.priority_work.is_empty() != self.is_done() {
            return fail("priority_work is empty exactly when requested is restorable");
        }
        Ok(())
    }
}

fn precondition(node: &Node, reason: &'static str) -> StateError {
    StateError::Precondition {
        node: node.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Op;
    use crate::tree::{Digest, Name, Path};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn n(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    fn node(tag: &str, parents: &[&Node]) -> Node {
        let inputs = parents
            .iter()
            .enumerate()
            .map(|(i, p)| (n(&format!("in{i}")), (*p).clone()))
            .collect();
        Node::new(inputs, Op::shell(tag), Path::parse("out").unwrap())
    }

    fn value(node: &Node) -> Tree {
        Tree::leaf(Digest::of_bytes(node.id().as_str().as_bytes()))
    }

    fn set(nodes: &[&Node]) -> BTreeSet<Node> {
        nodes.iter().map(|n| (*n).clone()).collect()
    }

    #[test]
    fn fresh_state_schedules_roots() {
        let a = node("a", &[]);
        let b = node("b", &[]);
        let c = node("c", &[&a, &b]);
        let state = GraphState::from_requested([c.clone()]);
        state.check_invariants().unwrap();
        assert_eq!(state.all_nodes(), &set(&[&a, &b, &c]));
        assert_eq!(state.runnable(), &set(&[&a, &b]));
        assert_eq!(state.priority_work(), &set(&[&a, &b]));
        assert_eq!(state.parents_known(), &set(&[&a, &b]));
    }

    #[test]
    fn transitions_do_not_mutate_the_original() {
        let a = node("a", &[]);
        let state = GraphState::from_requested([a.clone()]);
        let before = state.clone();
        let after = state.add_results([(a.clone(), value(&a))]).unwrap();
        assert_eq!(state, before);
        assert_ne!(after, before);
    }

    #[test]
    fn preconditions_are_enforced() {
        let a = node("a", &[]);
        let c = node("c", &[&a]);
        let stray = node("stray", &[]);
        let state = GraphState::from_requested([c.clone()]);

        assert!(matches!(
            state.add_results([(c.clone(), value(&c))]),
            Err(StateError::Precondition { .. })
        ));
        assert!(matches!(
            state.add_restorable([a.clone()]),
            Err(StateError::Precondition { .. })
        ));
        assert_eq!(
            state.add_results([(stray.clone(), value(&stray))]),
            Err(StateError::Precondition {
                node: stray.to_string(),
                reason: "not part of this graph"
            })
        );
    }

    #[test]
    fn add_results_is_idempotent_and_detects_conflicts() {
        let a = node("a", &[]);
        let state = GraphState::from_requested([a.clone()]);
        let once = state.add_results([(a.clone(), value(&a))]).unwrap();
        let twice = once.add_results([(a.clone(), value(&a))]).unwrap();
        assert_eq!(once, twice);

        let other = Tree::leaf(Digest::of_bytes(b"different"));
        assert!(matches!(
            once.add_results([(a.clone(), other)]),
            Err(StateError::Conflict { .. })
        ));
    }

    #[test]
    fn known_parents_unlock_lookup_but_not_execution() {
        let a = node("a", &[]);
        let c = node("c", &[&a]);
        let state = GraphState::from_requested([c.clone()])
            .add_results([(a.clone(), value(&a))])
            .unwrap();
        state.check_invariants().unwrap();
        assert!(state.parents_known().contains(&c));
        assert!(!state.runnable().contains(&c));
        // Tier 3: `a` is known but must be re-executed to become restorable.
        assert_eq!(state.priority_work(), &set(&[&a]));

        let state = state.add_results([(c.clone(), value(&c))]).unwrap();
        assert_eq!(state.priority_work(), &set(&[&a]));
        let state = state.add_restorable([a.clone()]).unwrap();
        assert!(state.runnable().contains(&c));
        // Tier 2: `c` is requested, runnable, known but not restorable.
        assert_eq!(state.priority_work(), &set(&[&c]));
        let state = state.add_restorable([c.clone()]).unwrap();
        assert!(state.is_done());
        assert!(state.priority_work().is_empty());
        state.check_invariants().unwrap();
    }

    #[test]
    fn unknown_frontier_comes_first() {
        let a = node("a", &[]);
        let b = node("b", &[]);
        let c = node("c", &[&a]);
        let state = GraphState::from_requested([c.clone(), b.clone()])
            .add_results([(a.clone(), value(&a))])
            .unwrap();
        assert_eq!(state.priority_work(), &set(&[&b]));
    }

    #[test]
    fn empty_request_is_done() {
        let state = GraphState::from_requested(Vec::new());
        state.check_invariants().unwrap();
        assert!(state.is_done());
        assert!(state.priority_work().is_empty());
    }

    /// Random DAG: node `j` may depend on any node `i < j`.
    fn arb_graph() -> impl Strategy<Value = (Vec<Node>, Vec<bool>)> {
        (1usize..10).prop_flat_map(|size| {
            (
                proptest::collection::vec(proptest::collection::vec(any::<bool>(), size), size),
                proptest::collection::vec(any::<bool>(), size),
            )
                .prop_map(move |(edges, requested)| {
                    let mut nodes: Vec<Node> = Vec::with_capacity(size);
                    for j in 0..size {
                        let built = {
                            let parents: Vec<&Node> =
                                (0..j).filter(|&i| edges[j][i]).map(|i| &nodes[i]).collect();
                            node(&format!("n{j}"), &parents)
                        };
                        nodes.push(built);
                    }
                    (nodes, requested)
                })
        })
    }

    proptest! {
        #[test]
        fn driving_priority_work_converges(
            (nodes, mask) in arb_graph(),
            coins in proptest::collection::vec(any::<bool>(), 64),
        ) {
            let requested: Vec<Node> = nodes
                .iter()
                .zip(&mask)
                .filter(|(_, want)| **want)
                .map(|(n, _)| n.clone())
                .collect();
            let mut state = GraphState::from_requested(requested);
            state.check_invariants().unwrap();
            let bound = 2 * state.all_nodes().len() + 1;
            let mut coin = coins.iter().cycle();

            let mut steps = 0;
            while !state.priority_work().is_empty() {
                prop_assert!(steps < bound, "no convergence after {} steps", steps);
                steps += 1;

                // Sometimes learn results through lookup alone, ahead of execution.
                if *coin.next().unwrap_or(&false) {
                    let lookups: Vec<(Node, Tree)> = state
                        .parents_known()
                        .difference(state.known())
                        .map(|n| (n.clone(), value(n)))
                        .collect();
                    state = state.add_results(lookups).unwrap();
                    state.check_invariants().unwrap();
                }

                let work: Vec<Node> = state.priority_work().iter().cloned().collect();
                let unknown: Vec<(Node, Tree)> = work
                    .iter()
                    .filter(|n| !state.known().contains(*n))
                    .map(|n| (n.clone(), value(n)))
                    .collect();
                let executed = unknown.is_empty() || *coin.next().unwrap_or(&true);
                state = state.add_results(unknown).unwrap();
                state.check_invariants().unwrap();
                if executed {
                    state = state.add_restorable(work).unwrap();
                    state.check_invariants().unwrap();
                }
            }
            prop_assert!(state.is_done());
        }
    }
}
