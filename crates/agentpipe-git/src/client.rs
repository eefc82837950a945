//! `PrOps`, backed by the `gh` CLI.

use agentpipe_core::git_ops::{PrHandle, PrOps};
use agentpipe_core::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

pub struct GhPrOps {
    owner: String,
    repo: String,
}

impl GhPrOps {
    /// Discovers `owner`/`repo` for the repository `gh` is currently pointed at.
    pub async fn discover() -> Result<Self> {
        let output = Command::new("gh")
            .args(["repo", "view", "--json", "owner,name"])
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke gh: {e}")))?;

        if !output.status.success() {
            return Err(Error::Other(format!(
                "gh repo view failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        #[derive(Deserialize)]
        struct RepoInfo {
            owner: Owner,
            name: String,
        }
        #[derive(Deserialize)]
        struct Owner {
            login: String,
        }

        let info: RepoInfo = serde_json::from_slice(&output.stdout)?;
        Ok(Self {
            owner: info.owner.login,
            repo: info.name,
        })
    }

    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

#[derive(Deserialize)]
struct PrView {
    url: String,
    number: u64,
}

#[async_trait]
impl PrOps for GhPrOps {
    async fn pr_exists(&self, branch: &str) -> Result<bool> {
        let output = Command::new("gh")
            .args([
                "pr", "view", branch, "--repo", &format!("{}/{}", self.owner, self.repo), "--json", "number",
            ])
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke gh: {e}")))?;
        Ok(output.status.success())
    }

    async fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PrHandle> {
        let repo_flag = format!("{}/{}", self.owner, self.repo);
        let mut args = vec![
            "pr", "create",
            "--title", title,
            "--body", body,
            "--base", base,
            "--head", branch,
            "--repo", &repo_flag,
        ];
        if draft {
            args.push("--draft");
        }

        let create_output = Command::new("gh")
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke gh: {e}")))?;
        if !create_output.status.success() {
            return Err(Error::Other(format!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&create_output.stderr)
            )));
        }

        let view_output = Command::new("gh")
            .args([
                "pr", "view", branch, "--repo", &repo_flag, "--json", "url,number",
            ])
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to invoke gh: {e}")))?;
        if !view_output.status.success() {
            return Err(Error::Other(format!(
                "gh pr view failed: {}",
                String::from_utf8_lossy(&view_output.stderr)
            )));
        }

        let view: PrView = serde_json::from_slice(&view_output.stdout)?;
        Ok(PrHandle {
            url: view.url,
            number: view.number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_with_explicit_owner_and_repo() {
        let ops = GhPrOps::new("acme", "widgets");
        assert_eq!(ops.owner, "acme");
        assert_eq!(ops.repo, "widgets");
    }
}
