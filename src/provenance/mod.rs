//! Provenance log: which calc produced which result, who recorded it, and who trusts it.
//!
//! Backed by SQLite. Every `save_run` is one transaction, and all inserts are
//! `INSERT OR IGNORE`, so recording the same run twice is harmless and concurrent writers
//! for different calcs never see each other's partial state.

pub mod trust;

pub use trust::{Candidate, Opinion, Verdict};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path as FsPath;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior, params};

use crate::calc::{Calc, Run};
use crate::error::LogError;
use crate::tree::{Digest, Tree};

const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug)]
pub struct Log {
    conn: Mutex<Connection>,
}

impl Log {
    pub fn open(path: &FsPath) -> Result<Self, LogError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Log::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, LogError> {
        Log::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LogError> {
        initialize_schema(&conn)?;
        Ok(Log {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LogError> {
        self.conn.lock().map_err(|_| LogError::Poisoned)
    }

    /// Record that `run.calc` produced `run.result`.
    pub fn save_run(&self, run: &Run) -> Result<(), LogError> {
        let calc_digest = run.calc.digest();
        let result_digest = run.result.digest();
        let calc_json = serde_json::to_string(&run.calc)?;
        let tree_json = serde_json::to_string(&run.result)?;

        let mut conn = self.lock()?;
        // Take the write lock up front so the busy timeout covers other handles' writers.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO calcs (calc_digest, calc) VALUES (?1, ?2)",
            params![calc_digest.as_str(), calc_json],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO results (result_digest, tree) VALUES (?1, ?2)",
            params![result_digest.as_str(), tree_json],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO runs \
             (calc_digest, result_digest, user, started_at_ms, finished_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                calc_digest.as_str(),
                result_digest.as_str(),
                run.user,
                run.started_at_ms as i64,
                run.finished_at_ms as i64,
            ],
        )?;
        tx.commit()?;
        log::debug!(
            "recorded run of calc {} -> {} by {}",
            calc_digest.short(),
            result_digest.short(),
            run.user
        );
        Ok(())
    }

    /// Record `user`'s ruling on one result of one calc, replacing any earlier ruling.
    pub fn set_opinion(
        &self,
        calc: &Digest,
        result: &Digest,
        user: &str,
        opinion: Opinion,
    ) -> Result<(), LogError> {
        let trusted = opinion == Opinion::Trust;
        self.lock()?.execute(
            "INSERT INTO opinions (calc_digest, result_digest, user, trusted) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(calc_digest, result_digest, user) DO UPDATE SET trusted = excluded.trusted",
            params![calc.as_str(), result.as_str(), user, trusted],
        )?;
        Ok(())
    }

    pub fn clear_opinion(&self, calc: &Digest, result: &Digest, user: &str) -> Result<(), LogError> {
        self.lock()?.execute(
            "DELETE FROM opinions WHERE calc_digest = ?1 AND result_digest = ?2 AND user = ?3",
            params![calc.as_str(), result.as_str(), user],
        )?;
        Ok(())
    }

    /// Every distinct result recorded for `calc`, with recorders and opinions.
    pub fn candidates(&self, calc: &Digest) -> Result<Vec<Candidate>, LogError> {
        let conn = self.lock()?;

        let mut recorded: BTreeMap<String, (String, BTreeSet<String>)> = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT runs.result_digest, results.tree, runs.user FROM runs \
             JOIN results ON results.result_digest = runs.result_digest \
             WHERE runs.calc_digest = ?1",
        )?;
        let rows = stmt.query_map(params![calc.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (digest, tree, user) = row?;
            recorded
                .entry(digest)
                .or_insert_with(|| (tree, BTreeSet::new()))
                .1
                .insert(user);
        }

        let mut opinions: BTreeMap<String, BTreeMap<String, Opinion>> = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT result_digest, user, trusted FROM opinions WHERE calc_digest = ?1",
        )?;
        let rows = stmt.query_map(params![calc.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?;
        for row in rows {
            let (digest, user, trusted) = row?;
            let opinion = if trusted {
                Opinion::Trust
            } else {
                Opinion::Distrust
            };
            opinions.entry(digest).or_default().insert(user, opinion);
        }

        let mut out = Vec::with_capacity(recorded.len());
        for (digest, (tree, recorded_by)) in recorded {
            out.push(Candidate {
                result: serde_json::from_str(&tree)?,
                opinions: opinions.remove(&digest).unwrap_or_default(),
                digest: Digest::parse(&digest)?,
                recorded_by,
            });
        }
        Ok(out)
    }

    /// Recorded runs of `calc`, oldest first.
    pub fn runs(&self, calc: &Digest) -> Result<Vec<Run>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT calcs.calc, results.tree, runs.user, runs.started_at_ms, runs.finished_at_ms \
             FROM runs \
             JOIN calcs ON calcs.calc_digest = runs.calc_digest \
             JOIN results ON results.result_digest = runs.result_digest \
             WHERE runs.calc_digest = ?1 ORDER BY runs.started_at_ms, runs.id",
        )?;
        let rows = stmt.query_map(params![calc.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (calc, tree, user, started, finished) = row?;
            out.push(Run {
                calc: serde_json::from_str(&calc)?,
                result: serde_json::from_str(&tree)?,
                user,
                started_at_ms: started as u64,
                finished_at_ms: finished as u64,
            });
        }
        Ok(out)
    }

    /// The one result `requester` should trust for `calc`, if any.
    ///
    /// `Ok(None)` means nothing acceptable is recorded yet; [`LogError::Conflict`] means several
    /// results compete and someone has to record an opinion.
    pub fn get_trusted_result(&self, calc: &Calc, requester: &str) -> Result<Option<Tree>, LogError> {
        let digest = calc.digest();
        let candidates = self.candidates(&digest)?;
        trust::resolve(&digest, candidates, requester)
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), LogError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS calcs (
           calc_digest TEXT PRIMARY KEY,
           calc TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS results (
           result_digest TEXT PRIMARY KEY,
           tree TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS runs (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           calc_digest TEXT NOT NULL REFERENCES calcs (calc_digest),
           result_digest TEXT NOT NULL REFERENCES results (result_digest),
           user TEXT NOT NULL,
           started_at_ms INTEGER NOT NULL,
           finished_at_ms INTEGER NOT NULL,
           UNIQUE (calc_digest, result_digest, user, started_at_ms)
         );
         CREATE INDEX IF NOT EXISTS runs_by_calc ON runs (calc_digest);
         CREATE TABLE IF NOT EXISTS opinions (
           calc_digest TEXT NOT NULL,
           result_digest TEXT NOT NULL,
           user TEXT NOT NULL,
           trusted INTEGER NOT NULL,
           PRIMARY KEY (calc_digest, result_digest, user)
         );",
    )?;
    Ok(())
}
