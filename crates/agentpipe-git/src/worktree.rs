//! Per-run worktree lifecycle.
//!
//! Each pipeline run that wants isolation from the invoking checkout gets its
//! own worktree under a configured base directory, named after the run id.
//! The lifecycle (active -> stale -> removed) mirrors how the orchestrator's
//! worktree pool tracked agent checkouts; here it tracks one worktree per
//! pipeline run instead of one per agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::process::Command;
use uuid::Uuid;

use agentpipe_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    /// Worktree is active and in use
    Active,
    /// Worktree is stale (run completed/failed)
    Stale,
    /// Worktree has been removed
    Removed,
}

/// A git worktree backing one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub id: String,
    pub name: String,
    pub path: String,
    pub branch_name: String,
    pub base_branch: String,
    pub status: WorktreeStatus,
    pub run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl Worktree {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        branch_name: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            path: path.into(),
            branch_name: branch_name.into(),
            base_branch: base_branch.into(),
            status: WorktreeStatus::Active,
            run_id: None,
            created_at: Utc::now(),
            removed_at: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn mark_stale(&mut self) {
        self.status = WorktreeStatus::Stale;
    }

    pub fn mark_removed(&mut self) {
        self.status = WorktreeStatus::Removed;
        self.removed_at = Some(Utc::now());
    }

    pub fn is_usable(&self) -> bool {
        self.status == WorktreeStatus::Active
    }
}

/// Creates an isolated worktree for a pipeline run.
///
/// Branches off `base_branch` into `<worktree_dir>/run-<run_id>`, creating
/// the branch if it doesn't already exist locally.
pub async fn create_run_worktree(
    run_id: Uuid,
    base_branch: &str,
    worktree_dir: &str,
) -> Result<Worktree> {
    let name = format!("run-{run_id}");
    let worktree_path = PathBuf::from(worktree_dir).join(&name);
    let branch_name = format!("pipeline/{name}");

    tokio::fs::create_dir_all(worktree_dir)
        .await
        .map_err(|e| Error::Other(format!("failed to create worktree directory: {e}")))?;

    let add_output = Command::new("git")
        .args([
            "worktree",
            "add",
            "-b",
            &branch_name,
            worktree_path.to_str().unwrap_or_default(),
            base_branch,
        ])
        .output()
        .await
        .map_err(|e| Error::Other(format!("failed to invoke git: {e}")))?;

    if !add_output.status.success() {
        let _ = Command::new("git").args(["worktree", "prune"]).output().await;
        return Err(Error::Other(format!(
            "failed to create worktree: {}",
            String::from_utf8_lossy(&add_output.stderr)
        )));
    }

    Ok(Worktree::new(
        name,
        worktree_path.to_string_lossy().to_string(),
        branch_name,
        base_branch.to_string(),
    )
    .with_run(run_id))
}

/// Removes a worktree and prunes its administrative metadata. Best-effort:
/// a worktree that was already removed out-of-band is not an error.
pub async fn remove_worktree(worktree: &mut Worktree) -> Result<()> {
    let _ = Command::new("git")
        .args(["worktree", "remove", "--force", &worktree.path])
        .output()
        .await;
    let _ = Command::new("git").args(["worktree", "prune"]).output().await;
    worktree.mark_removed();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_new_starts_active() {
        let wt = Worktree::new("run-x", "/tmp/test", "pipeline/run-x", "main");
        assert_eq!(wt.name, "run-x");
        assert_eq!(wt.status, WorktreeStatus::Active);
        assert!(wt.is_usable());
    }

    #[test]
    fn worktree_with_run_attaches_run_id() {
        let run_id = Uuid::new_v4();
        let wt = Worktree::new("run-x", "/tmp/test", "pipeline/run-x", "main").with_run(run_id);
        assert_eq!(wt.run_id, Some(run_id));
    }

    #[test]
    fn worktree_mark_stale_is_not_usable() {
        let mut wt = Worktree::new("run-x", "/tmp/test", "pipeline/run-x", "main");
        wt.mark_stale();
        assert_eq!(wt.status, WorktreeStatus::Stale);
        assert!(!wt.is_usable());
    }

    #[test]
    fn worktree_mark_removed_stamps_timestamp() {
        let mut wt = Worktree::new("run-x", "/tmp/test", "pipeline/run-x", "main");
        wt.mark_removed();
        assert_eq!(wt.status, WorktreeStatus::Removed);
        assert!(wt.removed_at.is_some());
        assert!(!wt.is_usable());
    }
}
