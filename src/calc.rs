//! Resolved units of work and the contract for running them against an [`Env`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::{EnvError, RunError};
use crate::graph::Op;
use crate::tree::{Digest, DigestBuilder, Name, Path, Tree};

/// Concrete input trees, an op, and the output locations to capture.
///
/// Unlike a [`crate::graph::Node`], a calc no longer references other nodes: every input is
/// a resolved value, so its digest identifies the computation in the provenance log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Calc {
    inputs: BTreeMap<Name, Tree>,
    op: Op,
    outputs: BTreeSet<Path>,
}

impl Calc {
    pub fn new(inputs: BTreeMap<Name, Tree>, op: Op, outputs: BTreeSet<Path>) -> Self {
        Calc {
            inputs,
            op,
            outputs,
        }
    }

    pub fn inputs(&self) -> &BTreeMap<Name, Tree> {
        &self.inputs
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn outputs(&self) -> &BTreeSet<Path> {
        &self.outputs
    }

    pub fn digest(&self) -> Digest {
        let mut b = DigestBuilder::new("calc");
        b.field(&self.inputs.len().to_string());
        for (name, tree) in &self.inputs {
            b.field(name.as_str()).field(tree.digest().as_str());
        }
        self.op.feed(&mut b);
        b.field(&self.outputs.len().to_string());
        for out in &self.outputs {
            b.field(&out.to_string());
        }
        b.finish()
    }
}

/// A recorded fact: `calc` produced `result`, attributed to `user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub calc: Calc,
    pub result: Tree,
    pub user: String,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Execute `calc` inside a fresh sandbox and capture its outputs.
///
/// The returned tree holds each requested output at its location. The sandbox is destroyed on
/// every path, including op and stow failures.
pub fn run<E: Env + ?Sized>(calc: &Calc, env: &mut E) -> Result<Tree, RunError> {
    let fail = |source: EnvError| RunError {
        calc: calc.digest(),
        message: source.to_string(),
        source,
    };

    let sandbox = env.create_sandbox().map_err(fail)?;
    let outcome = run_in(calc, env, &sandbox);
    let teardown = env.destroy_sandbox(sandbox);

    match (outcome, teardown) {
        (Ok(tree), Ok(())) => Ok(tree),
        (Ok(_), Err(e)) => Err(fail(e)),
        (Err(e), teardown) => {
            if let Err(t) = teardown {
                log::warn!("sandbox teardown after failed calc {} also failed: {t}", calc.digest().short());
            }
            Err(fail(e))
        }
    }
}

fn run_in<E: Env + ?Sized>(calc: &Calc, env: &mut E, sandbox: &E::Sandbox) -> Result<Tree, EnvError> {
    for (name, tree) in &calc.inputs {
        env.place(sandbox, &Path::from(name.clone()), tree)?;
    }
    env.run_op(&calc.op, sandbox)?;
    let mut captured = Vec::with_capacity(calc.outputs.len());
    for loc in &calc.outputs {
        captured.push((loc.clone(), env.stow(sandbox, loc)?));
    }
    Ok(Tree::from_entries(captured)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MemoryEnv;
    use pretty_assertions::assert_eq;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn runs_op_and_captures_outputs() {
        let mut env = MemoryEnv::new();
        let calc = Calc::new(
            BTreeMap::new(),
            Op::write("out.txt", "hello"),
            BTreeSet::from([p("out.txt")]),
        );
        let tree = run(&calc, &mut env).unwrap();
        let leaf = tree.pick(&p("out.txt")).unwrap();
        assert_eq!(env.content(leaf.as_leaf().unwrap()), Some(&b"hello"[..]));
        assert_eq!(env.live_sandboxes(), 0);
        assert_eq!(env.executions(), 1);
    }

    #[test]
    fn op_failure_is_reported_and_sandbox_torn_down() {
        let mut env = MemoryEnv::new();
        let calc = Calc::new(BTreeMap::new(), Op::new("explode"), BTreeSet::from([p("x")]));
        let err = run(&calc, &mut env).unwrap_err();
        assert_eq!(err.calc, calc.digest());
        assert!(err.message.contains("explode"), "{}", err.message);
        assert_eq!(env.live_sandboxes(), 0);
    }

    #[test]
    fn missing_output_still_tears_down() {
        let mut env = MemoryEnv::new();
        let calc = Calc::new(
            BTreeMap::new(),
            Op::write("a", "x"),
            BTreeSet::from([p("a"), p("never")]),
        );
        assert!(run(&calc, &mut env).is_err());
        assert_eq!(env.live_sandboxes(), 0);
    }

    #[test]
    fn digest_depends_on_every_part() {
        let base = Calc::new(BTreeMap::new(), Op::write("a", "x"), BTreeSet::from([p("a")]));
        let other_op = Calc::new(BTreeMap::new(), Op::write("a", "y"), BTreeSet::from([p("a")]));
        let other_out = Calc::new(
            BTreeMap::new(),
            Op::write("a", "x"),
            BTreeSet::from([p("a"), p("b")]),
        );
        assert_ne!(base.digest(), other_op.digest());
        assert_ne!(base.digest(), other_out.digest());
        assert_eq!(base.digest(), base.clone().digest());
    }
}
