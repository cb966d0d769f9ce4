//! Local directory sandboxes backed by on-disk storage.

use std::fs;
use std::path::{Path as FsPath, PathBuf};
use std::process::{Command, Stdio};

use tempfile::TempDir;

use crate::env::Env;
use crate::error::EnvError;
use crate::graph::Op;
use crate::storage::Storage;
use crate::tree::{Name, Path, Tree};

/// Runs ops in throwaway directories under `scratch`.
///
/// Inputs are restored from [`Storage`] (hard-linked, read-only); outputs are stored back.
/// Delivered results are restored under `deliver_to/<name>` when a delivery directory is set.
#[derive(Debug)]
pub struct LocalEnv {
    storage: Storage,
    scratch: PathBuf,
    deliver_to: Option<PathBuf>,
}

impl LocalEnv {
    pub fn new(storage: Storage, scratch: impl Into<PathBuf>) -> Result<Self, EnvError> {
        let scratch = scratch.into();
        fs::create_dir_all(&scratch).map_err(|source| EnvError::Io {
            path: scratch.clone(),
            source,
        })?;
        Ok(LocalEnv {
            storage,
            scratch,
            deliver_to: None,
        })
    }

    pub fn deliver_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.deliver_to = Some(dir.into());
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

fn io_err(path: &FsPath) -> impl FnOnce(std::io::Error) -> EnvError + '_ {
    move |source| EnvError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn param<'a>(op: &'a Op, key: &'static str) -> Result<&'a str, EnvError> {
    op.param(key).ok_or(EnvError::MissingParam(key))
}

fn write_file(target: &FsPath, bytes: &[u8]) -> Result<(), EnvError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    fs::write(target, bytes).map_err(io_err(target))
}

fn remove_any(path: &FsPath) -> Result<(), EnvError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(io_err(path)),
        Ok(_) => fs::remove_file(path).map_err(io_err(path)),
        Err(_) => Ok(()),
    }
}

impl Env for LocalEnv {
    type Sandbox = TempDir;

    fn create_sandbox(&mut self) -> Result<TempDir, EnvError> {
        tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&self.scratch)
            .map_err(io_err(&self.scratch))
    }

    fn destroy_sandbox(&mut self, sandbox: TempDir) -> Result<(), EnvError> {
        let path = sandbox.path().to_path_buf();
        sandbox.close().map_err(io_err(&path))
    }

    fn place(&mut self, sandbox: &TempDir, loc: &Path, tree: &Tree) -> Result<(), EnvError> {
        let target = loc.to_fs_path(sandbox.path());
        Ok(self.storage.restore(tree, &target)?)
    }

    fn run_op(&mut self, op: &Op, sandbox: &TempDir) -> Result<(), EnvError> {
        let dir = sandbox.path();
        log::info!("running {op} in {}", dir.display());
        match op.kind() {
            "shell" => {
                let cmd = param(op, "cmd")?;
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(cmd)
                    .current_dir(dir)
                    .stdin(Stdio::null())
                    .output()
                    .map_err(io_err(dir))?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(EnvError::OpFailed(format!(
                        "`{cmd}` exited with {}: {}",
                        output.status,
                        stderr.trim()
                    )));
                }
            }
            "write" => {
                let path = Path::parse(param(op, "path")?)?;
                write_file(&path.to_fs_path(dir), param(op, "text")?.as_bytes())?;
            }
            "concat" => {
                let mut out = Vec::new();
                for input in param(op, "inputs")?.split(',') {
                    let source = Path::parse(input.trim())?.to_fs_path(dir);
                    out.extend(fs::read(&source).map_err(io_err(&source))?);
                }
                let path = Path::parse(param(op, "path")?)?;
                write_file(&path.to_fs_path(dir), &out)?;
            }
            other => return Err(EnvError::UnsupportedOp(other.to_string())),
        }
        Ok(())
    }

    fn stow(&mut self, sandbox: &TempDir, loc: &Path) -> Result<Tree, EnvError> {
        let source = loc.to_fs_path(sandbox.path());
        if fs::symlink_metadata(&source).is_err() {
            return Err(EnvError::NothingToStow(loc.to_string()));
        }
        Ok(self.storage.store(&source)?)
    }

    fn can_restore(&self, tree: &Tree) -> bool {
        self.storage.can_restore(tree)
    }

    fn deliver(&mut self, name: &Name, tree: &Tree) -> Result<(), EnvError> {
        let Some(dir) = &self.deliver_to else {
            log::info!("{name} = {}", tree.digest().short());
            return Ok(());
        };
        let target = dir.join(name.as_str());
        remove_any(&target)?;
        self.storage.restore(tree, &target)?;
        log::info!("delivered {name} to {}", target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{Calc, run};
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, BTreeSet};

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn env(root: &FsPath) -> LocalEnv {
        let storage = Storage::open(root.join("store")).unwrap();
        LocalEnv::new(storage, root.join("scratch"))
            .unwrap()
            .deliver_to(root.join("out"))
    }

    #[test]
    fn shell_op_sees_inputs_and_stows_outputs() {
        let work = TempDir::new().unwrap();
        let mut env = env(work.path());

        let greet = Calc::new(
            BTreeMap::new(),
            Op::shell("mkdir -p out && printf hi > out/greeting"),
            BTreeSet::from([p("out")]),
        );
        let first = run(&greet, &mut env).unwrap();

        let shout = Calc::new(
            BTreeMap::from([(Name::new("src").unwrap(), first.pick(&p("out")).unwrap().clone())]),
            Op::shell("tr a-z A-Z < src/greeting > loud"),
            BTreeSet::from([p("loud")]),
        );
        let second = run(&shout, &mut env).unwrap();
        let loud = second.pick(&p("loud")).unwrap();

        env.deliver(&Name::new("result").unwrap(), loud).unwrap();
        assert_eq!(
            fs::read_to_string(work.path().join("out/result")).unwrap(),
            "HI"
        );
        assert_eq!(fs::read_dir(work.path().join("scratch")).unwrap().count(), 0);
    }

    #[test]
    fn failing_shell_op_reports_stderr() {
        let work = TempDir::new().unwrap();
        let mut env = env(work.path());
        let calc = Calc::new(
            BTreeMap::new(),
            Op::shell("echo broken >&2; exit 3"),
            BTreeSet::from([p("x")]),
        );
        let err = run(&calc, &mut env).unwrap_err();
        assert!(err.message.contains("broken"), "{}", err.message);
        assert_eq!(fs::read_dir(work.path().join("scratch")).unwrap().count(), 0);
    }
}
