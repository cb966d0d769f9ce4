//! Explicit run context: where things live and who is acting.
//!
//! Defaults, all overridable:
//! - storage at `<root>/.treemake/store`
//! - log database at `<root>/.treemake/log.sqlite3`
//! - sandboxes under `<root>/.treemake/scratch`
//! - user from `TREEMAKE_USER`, then `USER`, then `anonymous`

use std::fs;
use std::path::PathBuf;

use regex::Regex;

use crate::env::LocalEnv;
use crate::error::{ConfigError, Error, LogError, StorageError};
use crate::provenance::Log;
use crate::storage::Storage;

pub const STATE_DIR: &str = ".treemake";
pub const ANONYMOUS: &str = "anonymous";

const USER_RE: &str = r"^[A-Za-z0-9_.@-]+$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub root: PathBuf,
    pub store: PathBuf,
    pub log: PathBuf,
    pub scratch: PathBuf,
    pub user: String,
}

impl Context {
    pub fn from_root(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let user = user_from(|key| std::env::var(key).ok());
        Context::with_user_at(root.into(), user)
    }

    fn with_user_at(root: PathBuf, user: String) -> Result<Self, ConfigError> {
        validate_user(&user)?;
        let state = root.join(STATE_DIR);
        Ok(Context {
            store: state.join("store"),
            log: state.join("log.sqlite3"),
            scratch: state.join("scratch"),
            root,
            user,
        })
    }

    pub fn with_store(mut self, store: impl Into<PathBuf>) -> Self {
        self.store = store.into();
        self
    }

    pub fn with_log(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = log.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Result<Self, ConfigError> {
        let user = user.into();
        validate_user(&user)?;
        self.user = user;
        Ok(self)
    }

    pub fn open_storage(&self) -> Result<Storage, StorageError> {
        Storage::open(&self.store)
    }

    pub fn open_log(&self) -> Result<Log, LogError> {
        if let Some(parent) = self.log.parent() {
            fs::create_dir_all(parent).map_err(|source| LogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Log::open(&self.log)
    }

    pub fn local_env(&self) -> Result<LocalEnv, Error> {
        Ok(LocalEnv::new(self.open_storage()?, &self.scratch)?)
    }
}

/// First non-empty of `TREEMAKE_USER` and `USER` as reported by `lookup`.
pub fn user_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["TREEMAKE_USER", "USER"]
        .into_iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

pub fn validate_user(user: &str) -> Result<(), ConfigError> {
    let re = Regex::new(USER_RE)?;
    if !re.is_match(user) {
        return Err(ConfigError::InvalidUser {
            user: user.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn user_precedence() {
        assert_eq!(user_from(lookup(&[("TREEMAKE_USER", "ci"), ("USER", "ann")])), "ci");
        assert_eq!(user_from(lookup(&[("TREEMAKE_USER", ""), ("USER", "ann")])), "ann");
        assert_eq!(user_from(lookup(&[])), ANONYMOUS);
    }

    #[test]
    fn user_names_are_checked() {
        for ok in ["ann", "ann.lee@example.com", "build-bot_2"] {
            assert!(validate_user(ok).is_ok(), "{ok}");
        }
        for bad in ["", "ann lee", "a/b", "ann\n"] {
            assert!(
                matches!(validate_user(bad), Err(ConfigError::InvalidUser { .. })),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn defaults_live_under_the_state_dir() {
        let ctx = Context::with_user_at(PathBuf::from("/proj"), "ann".to_string()).unwrap();
        assert_eq!(ctx.store, PathBuf::from("/proj/.treemake/store"));
        assert_eq!(ctx.log, PathBuf::from("/proj/.treemake/log.sqlite3"));
        let ctx = ctx.with_store("/elsewhere").with_user("bob").unwrap();
        assert_eq!(ctx.store, PathBuf::from("/elsewhere"));
        assert_eq!(ctx.user, "bob");
        assert!(ctx.with_user("not ok").is_err());
    }

    #[test]
    fn opens_storage_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::with_user_at(dir.path().to_path_buf(), "ann".to_string()).unwrap();
        ctx.open_storage().unwrap();
        ctx.open_log().unwrap();
        assert!(ctx.store.join("blobs").is_dir());
        assert!(ctx.log.is_file());
    }
}
