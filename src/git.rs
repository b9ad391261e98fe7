//! Version-control capability: has a worker's branch landed on the base branch?

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use git2::{BranchType, ErrorCode, Oid, Repository};

use crate::{flog_debug, flog_warn, Error, Result};

pub trait BranchStatus: Send + Sync {
    /// A missing branch is reported as not merged.
    fn is_branch_merged(&self, branch: &str) -> Result<bool>;

    /// Commit time of the branch tip, if the branch exists.
    fn tip_time(&self, branch: &str) -> Result<Option<DateTime<Utc>>>;
}

pub struct GitBranchStatus {
    repo_path: PathBuf,
    base_branch: String,
    start_commit: Option<Oid>,
}

impl GitBranchStatus {
    pub fn open(repo_path: &Path, base_branch: &str) -> Result<Self> {
        flog_debug!(
            "GitBranchStatus::open path={} base={}",
            repo_path.display(),
            base_branch
        );
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            base_branch: base_branch.to_string(),
            start_commit: None,
        })
    }

    /// Base commit recorded when the phase started. Branches still pointing
    /// at it carry no new work and are never reported as merged.
    pub fn with_start_commit(mut self, commit: &str) -> Result<Self> {
        self.start_commit = Some(Oid::from_str(commit)?);
        Ok(self)
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Current tip of the base branch, as a hex commit id.
    pub fn base_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let tip = find_tip(&repo, &self.base_branch)?.ok_or_else(|| {
            Error::State(format!("base branch '{}' not found", self.base_branch))
        })?;
        Ok(tip.to_string())
    }
}

/// Resolve a branch to its tip commit, trying local then `origin/`.
fn find_tip(repo: &Repository, branch: &str) -> Result<Option<Oid>> {
    let candidates = [
        (branch.to_string(), BranchType::Local),
        (format!("origin/{}", branch), BranchType::Remote),
    ];
    for (name, kind) in candidates {
        match repo.find_branch(&name, kind) {
            Ok(b) => return Ok(Some(b.get().peel_to_commit()?.id())),
            Err(e) if e.code() == ErrorCode::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

impl BranchStatus for GitBranchStatus {
    fn is_branch_merged(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let Some(tip) = find_tip(&repo, branch)? else {
            flog_debug!("is_branch_merged: branch '{}' not found", branch);
            return Ok(false);
        };
        let base = find_tip(&repo, &self.base_branch)?.ok_or_else(|| {
            Error::State(format!("base branch '{}' not found", self.base_branch))
        })?;

        if Some(tip) == self.start_commit {
            return Ok(false);
        }
        if tip == base {
            // Fast-forwarded into base; only counts once we know where the phase began
            return Ok(self.start_commit.is_some());
        }
        Ok(repo.graph_descendant_of(base, tip)?)
    }

    fn tip_time(&self, branch: &str) -> Result<Option<DateTime<Utc>>> {
        let repo = self.repo()?;
        let Some(tip) = find_tip(&repo, branch)? else {
            return Ok(None);
        };
        let commit = repo.find_commit(tip)?;
        Ok(Utc.timestamp_opt(commit.time().seconds(), 0).single())
    }
}

/// Branch status for a project without a repository: nothing is merged.
pub struct NoBranches;

impl BranchStatus for NoBranches {
    fn is_branch_merged(&self, _branch: &str) -> Result<bool> {
        Ok(false)
    }

    fn tip_time(&self, _branch: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

/// Open the repository at `repo_path`, falling back to `NoBranches` when
/// there is none. `start_commit` is the phase's recorded base commit.
pub fn open_branch_status(
    repo_path: &Path,
    base_branch: &str,
    start_commit: Option<&str>,
) -> Arc<dyn BranchStatus> {
    let opened = GitBranchStatus::open(repo_path, base_branch).and_then(|g| match start_commit {
        Some(commit) => g.with_start_commit(commit),
        None => Ok(g),
    });
    match opened {
        Ok(status) => Arc::new(status),
        Err(e) => {
            flog_warn!(
                "No usable repository at {} ({}), branch signals disabled",
                repo_path.display(),
                e
            );
            Arc::new(NoBranches)
        }
    }
}

/// Tip of `base_branch` in the repository at `repo_path`, if there is one.
pub fn current_base_commit(repo_path: &Path, base_branch: &str) -> Option<String> {
    match GitBranchStatus::open(repo_path, base_branch).and_then(|g| g.base_commit()) {
        Ok(commit) => Some(commit),
        Err(e) => {
            flog_warn!("Cannot record base commit: {}", e);
            None
        }
    }
}

/// In-memory branch states for tests.
#[derive(Default)]
pub struct MemoryBranches {
    merged: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryBranches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_merged(&self, branch: &str, at: DateTime<Utc>) {
        self.merged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(branch.to_string(), at);
    }

    /// Simulates a force-reset of the branch.
    pub fn unmerge(&self, branch: &str) {
        self.merged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(branch);
    }
}

impl BranchStatus for MemoryBranches {
    fn is_branch_merged(&self, branch: &str) -> Result<bool> {
        Ok(self
            .merged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(branch))
    }

    fn tip_time(&self, branch: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .merged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(branch)
            .copied())
    }
}
