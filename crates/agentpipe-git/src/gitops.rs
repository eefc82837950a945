//! `GitOps`, backed by the `git` CLI.

use agentpipe_core::git_ops::GitOps;
use agentpipe_core::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// Shells out to `git` in a fixed working directory for every call.
pub struct CliGitOps {
    repo_dir: PathBuf,
}

impl CliGitOps {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo_dir).args(args);
        cmd
    }
}

impl Default for CliGitOps {
    fn default() -> Self {
        Self::new(".")
    }
}

#[async_trait]
impl GitOps for CliGitOps {
    async fn current_commit(&self) -> Result<String> {
        let output = self
            .command(&["rev-parse", "HEAD"])
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke git: {e}")))?;
        if !output.status.success() {
            return Err(Error::Other(format!(
                "git rev-parse HEAD failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn has_uncommitted_changes(&self) -> Result<bool> {
        let output = self
            .command(&["status", "--porcelain"])
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke git: {e}")))?;
        if !output.status.success() {
            return Err(Error::Other(format!(
                "git status failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(!output.stdout.is_empty())
    }

    async fn create_pipeline_commit(
        &self,
        stage_name: &str,
        run_id: &str,
        custom_message: Option<&str>,
        template: Option<&str>,
    ) -> Result<String> {
        let message = match custom_message {
            Some(m) => m.to_string(),
            None => {
                let template = template.unwrap_or("pipeline({stage}): run {run_id}");
                template
                    .replace("{stage}", stage_name)
                    .replace("{run_id}", run_id)
            }
        };

        let add_output = self
            .command(&["add", "-A"])
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke git: {e}")))?;
        if !add_output.status.success() {
            return Err(Error::Other(format!(
                "git add failed: {}",
                String::from_utf8_lossy(&add_output.stderr)
            )));
        }

        let commit_output = self
            .command(&["commit", "-m", &message])
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke git: {e}")))?;
        if !commit_output.status.success() {
            return Err(Error::Other(format!(
                "git commit failed: {}",
                String::from_utf8_lossy(&commit_output.stderr)
            )));
        }

        self.current_commit().await
    }

    async fn commit_message(&self, sha: &str) -> Result<String> {
        let output = self
            .command(&["log", "-1", "--format=%B", sha])
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke git: {e}")))?;
        if !output.status.success() {
            return Err(Error::Other(format!(
                "git log failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_template_substitutes_stage_and_run() {
        let template = "pipeline({stage}): run {run_id}";
        let rendered = template.replace("{stage}", "lint").replace("{run_id}", "abc123");
        assert_eq!(rendered, "pipeline(lint): run abc123");
    }

    #[test]
    fn default_points_at_current_directory() {
        let ops = CliGitOps::default();
        assert_eq!(ops.repo_dir, PathBuf::from("."));
    }
}
