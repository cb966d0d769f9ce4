//! Graph file (graph.json): named tasks wired together by reference.
//!
//! JSON shape:
//! {
//!   "nodes": [
//!     { "name": "hello", "op": "write", "params": { "path": "out", "text": "hello" } },
//!     {
//!       "name": "greeting",
//!       "op": "concat",
//!       "params": { "inputs": "l/out,r/out", "path": "out" },
//!       "inputs": { "l": "hello", "r": "world:out" },   // "task" or "task:output/path"
//!       "outputs": ["out"],                             // default ["out"]
//!       "levels": []                                    // optional nesting levels
//!     }
//!   ],
//!   "targets": ["greeting"]                             // optional, default: every output
//! }
//!
//! Input values are placed in the sandbox under their input name, so the concat above reads
//! `l/out` and `r/out`.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, bail};
use regex::Regex;
use serde::Deserialize;

use crate::graph::{Node, Op, Task};
use crate::tree::{Name, Path};

const REF_RE: &str = r"^([A-Za-z0-9_.@-]+)(?::(.+))?$";

#[derive(Debug, Clone, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub nodes: Vec<RawTask>,

    #[serde(default)]
    pub targets: Vec<String>,
}

/// Raw task shape as it appears in graph.json.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTask {
    pub name: String,

    pub op: String,

    #[serde(default)]
    pub params: BTreeMap<String, String>,

    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,

    #[serde(default)]
    pub levels: Vec<String>,
}

fn default_outputs() -> Vec<String> {
    vec!["out".to_string()]
}

/// A reference to one output of a named task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub task: String,
    pub output: Option<Path>,
}

impl TaskRef {
    fn parse(re: &Regex, raw: &str) -> anyhow::Result<TaskRef> {
        let Some(caps) = re.captures(raw.trim()) else {
            bail!("malformed reference `{raw}` (expected `task` or `task:output/path`)");
        };
        let task = caps[1].to_string();
        let output = match caps.get(2) {
            Some(m) => Some(
                Path::parse(m.as_str()).with_context(|| format!("in reference `{raw}`"))?,
            ),
            None => None,
        };
        Ok(TaskRef { task, output })
    }

    /// The name a resolved reference is delivered under.
    fn delivery_name(&self) -> anyhow::Result<Name> {
        let raw = match &self.output {
            None => self.task.clone(),
            Some(out) => format!("{}:{}", self.task, out.to_string().replace('/', ".")),
        };
        Ok(Name::new(raw)?)
    }
}

/// Validated graph: every task built, every target resolved to a node.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    pub tasks: BTreeMap<String, Task>,
    pub targets: BTreeMap<Name, Node>,
    ref_re: Regex,
}

impl ValidatedGraph {
    /// Resolve `refs` against the built tasks; an empty list selects the file's targets.
    pub fn select(&self, refs: &[String]) -> anyhow::Result<BTreeMap<Name, Node>> {
        if refs.is_empty() {
            return Ok(self.targets.clone());
        }
        let mut out = BTreeMap::new();
        for raw in refs {
            let r = TaskRef::parse(&self.ref_re, raw)?;
            out.insert(r.delivery_name()?, resolve(&self.tasks, &r)?);
        }
        Ok(out)
    }
}

impl GraphSpec {
    pub fn load(path: &std::path::Path) -> anyhow::Result<GraphSpec> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading graph file {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing graph file {}", path.display()))
    }

    /// Validate a GraphSpec and build its tasks:
    /// - unique task names
    /// - well-formed ops, outputs, levels
    /// - every input reference resolves
    /// - the reference graph is acyclic
    pub fn validate_and_build(&self) -> anyhow::Result<ValidatedGraph> {
        let re = Regex::new(REF_RE)?;

        // 1) Unique names, parsed references.
        let mut raw_tasks: BTreeMap<&str, &RawTask> = BTreeMap::new();
        let mut deps: BTreeMap<&str, Vec<(Name, TaskRef)>> = BTreeMap::new();
        for raw in &self.nodes {
            if raw_tasks.insert(raw.name.as_str(), raw).is_some() {
                bail!("duplicate task name in graph file: {}", raw.name);
            }
            if !re.captures(&raw.name).is_some_and(|c| c.get(2).is_none()) {
                bail!("invalid task name `{}`", raw.name);
            }
            let mut refs = Vec::new();
            for (input, target) in &raw.inputs {
                let input = Name::new(input.as_str())
                    .with_context(|| format!("task {}: input name", raw.name))?;
                let r = TaskRef::parse(&re, target)
                    .with_context(|| format!("task {}: input {input}", raw.name))?;
                refs.push((input, r));
            }
            deps.insert(raw.name.as_str(), refs);
        }
        if raw_tasks.is_empty() {
            bail!("graph file contained no tasks");
        }

        // 2) References name existing tasks.
        for (name, refs) in &deps {
            for (input, r) in refs {
                if !raw_tasks.contains_key(r.task.as_str()) {
                    bail!("task {name}: input {input} references unknown task {}", r.task);
                }
            }
        }

        // 3) Cycle detection (DFS coloring); post-order doubles as build order.
        #[derive(Copy, Clone, PartialEq, Eq)]
        enum Mark {
            Temp,
            Perm,
        }

        fn dfs<'a>(
            v: &'a str,
            deps: &BTreeMap<&'a str, Vec<(Name, TaskRef)>>,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
            order: &mut Vec<&'a str>,
        ) -> anyhow::Result<()> {
            match marks.get(v) {
                Some(Mark::Perm) => return Ok(()),
                Some(Mark::Temp) => {
                    stack.push(v);
                    bail!("cycle detected in graph file: {}", stack.join(" -> "));
                }
                None => {}
            }
            marks.insert(v, Mark::Temp);
            stack.push(v);
            if let Some(refs) = deps.get(v) {
                for (_, r) in refs {
                    if let Some((&dep, _)) = deps.get_key_value(r.task.as_str()) {
                        dfs(dep, deps, marks, stack, order)?;
                    }
                }
            }
            stack.pop();
            marks.insert(v, Mark::Perm);
            order.push(v);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        let mut order = Vec::new();
        for &name in raw_tasks.keys() {
            let mut stack = Vec::new();
            dfs(name, &deps, &mut marks, &mut stack, &mut order)?;
        }

        // 4) Build tasks, dependencies first.
        let mut tasks: BTreeMap<String, Task> = BTreeMap::new();
        for name in order {
            let raw = raw_tasks[name];
            let task = build_task(raw, &deps[name], &tasks)
                .with_context(|| format!("building task {name}"))?;
            tasks.insert(name.to_string(), task);
        }

        // 5) Targets.
        let mut targets = BTreeMap::new();
        if self.targets.is_empty() {
            for (name, task) in &tasks {
                for output in task.outputs() {
                    let r = TaskRef {
                        task: name.clone(),
                        output: (task.outputs().len() > 1).then(|| output.clone()),
                    };
                    targets.insert(r.delivery_name()?, task.node(output)?);
                }
            }
        } else {
            for raw in &self.targets {
                let r = TaskRef::parse(&re, raw).with_context(|| format!("target {raw}"))?;
                targets.insert(r.delivery_name()?, resolve(&tasks, &r)?);
            }
        }

        Ok(ValidatedGraph {
            tasks,
            targets,
            ref_re: re,
        })
    }
}

fn build_task(
    raw: &RawTask,
    refs: &[(Name, TaskRef)],
    built: &BTreeMap<String, Task>,
) -> anyhow::Result<Task> {
    let mut inputs = BTreeMap::new();
    for (input, r) in refs {
        inputs.insert(input.clone(), resolve(built, r)?);
    }

    let mut op = Op::new(raw.op.as_str());
    for (key, value) in &raw.params {
        op = op.with(key.as_str(), value.as_str());
    }

    let mut outputs = BTreeSet::new();
    for out in &raw.outputs {
        outputs.insert(Path::parse(out).with_context(|| format!("output `{out}`"))?);
    }

    let mut task = Task::new(inputs, op, outputs)?;
    for level in &raw.levels {
        task = task.descend(Name::new(level.as_str())?)?;
    }
    Ok(task)
}

fn resolve(tasks: &BTreeMap<String, Task>, r: &TaskRef) -> anyhow::Result<Node> {
    let Some(task) = tasks.get(&r.task) else {
        bail!("unknown task {}", r.task);
    };
    let output = match &r.output {
        Some(out) => out.clone(),
        None => {
            let mut outputs = task.outputs().iter();
            match (outputs.next(), outputs.next()) {
                (Some(only), None) => only.clone(),
                _ => bail!(
                    "task {} has several outputs; reference one as `{}:<output>`",
                    r.task,
                    r.task
                ),
            }
        }
    };
    Ok(task.node(&output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(json: &str) -> GraphSpec {
        serde_json::from_str(json).unwrap()
    }

    fn n(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    const GREETING: &str = r#"{
        "nodes": [
            { "name": "hello", "op": "write", "params": { "path": "out", "text": "hello" } },
            { "name": "world", "op": "write", "params": { "path": "out", "text": "world" } },
            {
                "name": "greeting",
                "op": "concat",
                "params": { "inputs": "l/out,r/out", "path": "out" },
                "inputs": { "l": "hello", "r": "world:out" }
            }
        ],
        "targets": ["greeting"]
    }"#;

    #[test]
    fn builds_wired_nodes() {
        let graph = spec(GREETING).validate_and_build().unwrap();
        assert_eq!(graph.tasks.len(), 3);
        let greeting = &graph.targets[&n("greeting")];
        assert_eq!(greeting.op().kind(), "concat");
        let hello = graph.tasks["hello"].node(&Path::parse("out").unwrap()).unwrap();
        assert_eq!(greeting.inputs()[&n("l")], hello);
        assert_eq!(greeting.parents().len(), 2);
    }

    #[test]
    fn select_overrides_targets() {
        let graph = spec(GREETING).validate_and_build().unwrap();
        let picked = graph.select(&["hello".to_string(), "world:out".to_string()]).unwrap();
        assert_eq!(
            picked.keys().cloned().collect::<Vec<_>>(),
            vec![n("hello"), n("world:out")]
        );
        assert_eq!(graph.select(&[]).unwrap(), graph.targets);
        assert!(graph.select(&["nope".to_string()]).is_err());
    }

    #[test]
    fn default_targets_cover_every_output() {
        let graph = spec(
            r#"{ "nodes": [
                { "name": "pair", "op": "shell", "params": { "cmd": "true" }, "outputs": ["a", "b"] },
                { "name": "one", "op": "shell", "params": { "cmd": "true" } }
            ] }"#,
        )
        .validate_and_build()
        .unwrap();
        assert_eq!(
            graph.targets.keys().cloned().collect::<Vec<_>>(),
            vec![n("one"), n("pair:a"), n("pair:b")]
        );
        let a = &graph.targets[&n("pair:a")];
        assert_eq!(a.siblings().len(), 2);
    }

    #[test]
    fn rejects_bad_graphs() {
        let cases = [
            (r#"{ "nodes": [] }"#, "no tasks"),
            (
                r#"{ "nodes": [ { "name": "a", "op": "x" }, { "name": "a", "op": "y" } ] }"#,
                "duplicate",
            ),
            (
                r#"{ "nodes": [ { "name": "a", "op": "x", "inputs": { "i": "b" } } ] }"#,
                "unknown task",
            ),
            (
                r#"{ "nodes": [
                    { "name": "a", "op": "x", "inputs": { "i": "b" } },
                    { "name": "b", "op": "x", "inputs": { "i": "a" } }
                ] }"#,
                "cycle",
            ),
            (
                r#"{ "nodes": [
                    { "name": "a", "op": "x", "outputs": ["p", "q"] },
                    { "name": "b", "op": "x", "inputs": { "i": "a" } }
                ] }"#,
                "several outputs",
            ),
            (
                r#"{ "nodes": [ { "name": "a", "op": "x", "outputs": ["p", "p/q"] } ] }"#,
                "building task a",
            ),
        ];
        for (json, needle) in cases {
            let err = spec(json).validate_and_build().unwrap_err();
            let text = format!("{err:#}");
            assert!(text.contains(needle), "{needle}: {text}");
        }
    }

    #[test]
    fn levels_become_part_of_identity() {
        let graph = spec(
            r#"{ "nodes": [
                { "name": "flat", "op": "shell", "params": { "cmd": "true" } },
                { "name": "nested", "op": "shell", "params": { "cmd": "true" }, "levels": ["item"] }
            ] }"#,
        )
        .validate_and_build()
        .unwrap();
        let flat = &graph.targets[&n("flat")];
        let nested = &graph.targets[&n("nested")];
        assert_eq!(nested.levels(), &[n("item")]);
        assert_ne!(flat, nested);
    }

    #[test]
    fn references_parse() {
        let re = Regex::new(REF_RE).unwrap();
        assert_eq!(
            TaskRef::parse(&re, "build:bin/tool").unwrap(),
            TaskRef {
                task: "build".to_string(),
                output: Some(Path::parse("bin/tool").unwrap()),
            }
        );
        assert_eq!(TaskRef::parse(&re, "x").unwrap().output, None);
        assert!(TaskRef::parse(&re, "a b").is_err());
        assert!(TaskRef::parse(&re, "a:/abs").is_err());
    }
}
