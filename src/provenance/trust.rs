//! Deciding which recorded result for a calc to trust.
//!
//! Per candidate result:
//! - the requester's own opinion, when present, decides alone
//! - otherwise other users' opinions are pooled: none at all, or endorsements without any
//!   rejection, accept; rejections without endorsement reject; both at once is a dispute
//!
//! Across candidates: a dispute, or more than one accepted result, is a conflict for a human
//! to settle by recording an opinion. No accepted result means nothing is known yet.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::tree::{Digest, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opinion {
    Trust,
    Distrust,
}

/// One distinct result recorded for a calc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub digest: Digest,
    pub result: Tree,
    pub recorded_by: BTreeSet<String>,
    pub opinions: BTreeMap<String, Opinion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
    Disputed,
}

pub fn judge(opinions: &BTreeMap<String, Opinion>, requester: &str) -> Verdict {
    if let Some(own) = opinions.get(requester) {
        return match own {
            Opinion::Trust => Verdict::Accepted,
            Opinion::Distrust => Verdict::Rejected,
        };
    }
    let trusted = opinions.values().any(|o| *o == Opinion::Trust);
    let distrusted = opinions.values().any(|o| *o == Opinion::Distrust);
    match (trusted, distrusted) {
        (_, false) => Verdict::Accepted,
        (false, true) => Verdict::Rejected,
        (true, true) => Verdict::Disputed,
    }
}

pub fn resolve(
    calc: &Digest,
    candidates: Vec<Candidate>,
    requester: &str,
) -> Result<Option<Tree>, LogError> {
    let mut accepted = Vec::new();
    let mut disputed = false;
    for candidate in &candidates {
        match judge(&candidate.opinions, requester) {
            Verdict::Accepted => accepted.push(candidate),
            Verdict::Rejected => {}
            Verdict::Disputed => disputed = true,
        }
    }

    if disputed || accepted.len() > 1 {
        return Err(LogError::Conflict {
            calc: calc.clone(),
            candidates: candidates.into_iter().map(|c| c.digest).collect(),
        });
    }
    Ok(accepted.first().map(|c| c.result.clone()))
}
