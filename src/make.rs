//! The make driver: drive a [`GraphState`] to completion, then deliver results.
//!
//! Each round:
//! 1. look up every node whose parents are known in the provenance log, repeating until no
//!    new result turns up, and mark known results restorable when the env can place them
//! 2. stop once `priority_work` is empty (every requested node is restorable)
//! 3. otherwise execute the calc of each priority node, record the run, and feed the results
//!    for the node and any sibling outputs in the graph back into the state

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::calc::{self, Run, now_ms};
use crate::env::Env;
use crate::error::Error;
use crate::graph::{GraphState, Node};
use crate::provenance::Log;
use crate::tree::{Digest, Name, Tree};

/// What a make call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MakeReport {
    /// Digests of calcs that were executed, in execution order.
    pub executed: Vec<Digest>,
    /// Digests of calcs whose result came from the log.
    pub reused: BTreeSet<Digest>,
    pub delivered: BTreeMap<Name, Tree>,
}

pub struct Maker<'a, E: Env + ?Sized> {
    env: &'a mut E,
    log: &'a Log,
    user: &'a str,
    misses: BTreeSet<Node>,
    report: MakeReport,
}

impl<'a, E: Env + ?Sized> Maker<'a, E> {
    pub fn new(env: &'a mut E, log: &'a Log, user: &'a str) -> Self {
        Maker {
            env,
            log,
            user,
            misses: BTreeSet::new(),
            report: MakeReport::default(),
        }
    }

    /// Materialize every requested node and deliver it under its name.
    pub fn make(mut self, requested: &BTreeMap<Name, Node>) -> Result<MakeReport, Error> {
        let mut state = GraphState::from_requested(requested.values().cloned());
        log::info!(
            "make: {} requested, {} nodes in graph",
            requested.len(),
            state.all_nodes().len()
        );

        loop {
            state = self.resolve_from_log(state)?;
            debug_assert!(state.check_invariants().is_ok());
            if state.priority_work().is_empty() {
                break;
            }
            state = self.execute(state)?;
        }

        for (name, node) in requested {
            let Some(tree) = state.result(node) else {
                // is_done() guarantees every requested node has a result.
                continue;
            };
            self.env.deliver(name, tree)?;
            self.report.delivered.insert(name.clone(), tree.clone());
        }
        log::info!(
            "make: {} executed, {} reused from log",
            self.report.executed.len(),
            self.report.reused.len()
        );
        Ok(self.report)
    }

    fn resolve_from_log(&mut self, mut state: GraphState) -> Result<GraphState, Error> {
        loop {
            let pending: Vec<Node> = state
                .parents_known()
                .difference(state.known())
                .filter(|node| !self.misses.contains(*node))
                .cloned()
                .collect();

            let mut found = Vec::new();
            for node in pending {
                let calc = node.calc(|parent| state.result(parent))?;
                match self.log.get_trusted_result(&calc, self.user)? {
                    Some(tree) => {
                        log::debug!("log hit for {node} (calc {})", calc.digest().short());
                        found.push((node.clone(), node.result_from(&tree)?));
                        self.report.reused.insert(calc.digest());
                    }
                    None => {
                        self.misses.insert(node);
                    }
                }
            }
            if found.is_empty() {
                break;
            }
            state = state.add_results(found)?;
        }

        let restorable: Vec<Node> = state
            .known()
            .difference(state.restorable())
            .filter(|node| {
                state
                    .result(node)
                    .is_some_and(|tree| self.env.can_restore(tree))
            })
            .cloned()
            .collect();
        Ok(state.add_restorable(restorable)?)
    }

    fn execute(&mut self, mut state: GraphState) -> Result<GraphState, Error> {
        let work: Vec<Node> = state.priority_work().iter().cloned().collect();
        let mut outcomes: BTreeMap<Digest, Tree> = BTreeMap::new();

        for node in work {
            if state.restorable().contains(&node) {
                // Already produced by a sibling earlier in this batch.
                continue;
            }
            let calc = node.calc(|parent| state.result(parent))?;
            let key = calc.digest();
            let outcome = match outcomes.get(&key) {
                Some(tree) => tree.clone(),
                None => {
                    log::info!("executing {node} (calc {})", key.short());
                    let started_at_ms = now_ms();
                    let tree = calc::run(&calc, &mut *self.env)?;
                    self.log.save_run(&Run {
                        calc,
                        result: tree.clone(),
                        user: self.user.to_string(),
                        started_at_ms,
                        finished_at_ms: now_ms(),
                    })?;
                    self.report.executed.push(key.clone());
                    outcomes.insert(key, tree.clone());
                    tree
                }
            };

            let mut produced = Vec::new();
            for output in node.siblings() {
                let sibling = node.sibling(output)?;
                if state.parents_known().contains(&sibling) {
                    produced.push((sibling.clone(), sibling.result_from(&outcome)?));
                }
            }
            let nodes: Vec<Node> = produced.iter().map(|(n, _)| n.clone()).collect();
            state = state.add_results(produced)?.add_restorable(nodes)?;
        }
        Ok(state)
    }
}

/// Drive `requested` to completion with `env` and `log`, acting as `user`.
pub fn make<E: Env + ?Sized>(
    requested: &BTreeMap<Name, Node>,
    env: &mut E,
    log: &Log,
    user: &str,
) -> Result<MakeReport, Error> {
    Maker::new(env, log, user).make(requested)
}
