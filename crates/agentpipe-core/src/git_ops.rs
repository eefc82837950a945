//! `GitOps`: worktree, branch and commit primitives the engine depends on only
//! through this trait. The concrete git-CLI-backed implementation lives in
//! `agentpipe-git`.

use async_trait::async_trait;

use crate::Result;

#[async_trait]
pub trait GitOps: Send + Sync {
    async fn current_commit(&self) -> Result<String>;
    async fn has_uncommitted_changes(&self) -> Result<bool>;
    async fn create_pipeline_commit(
        &self,
        stage_name: &str,
        run_id: &str,
        custom_message: Option<&str>,
        template: Option<&str>,
    ) -> Result<String>;
    async fn commit_message(&self, sha: &str) -> Result<String>;
}

#[async_trait]
pub trait PrOps: Send + Sync {
    async fn pr_exists(&self, branch: &str) -> Result<bool>;
    async fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PrHandle>;
}

#[derive(Debug, Clone)]
pub struct PrHandle {
    pub url: String,
    pub number: u64,
}

#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeGitOps {
        pub dirty: AtomicBool,
        pub commits: Mutex<Vec<String>>,
        pub next_sha: Mutex<u32>,
    }

    impl FakeGitOps {
        pub fn with_dirty(dirty: bool) -> Self {
            Self {
                dirty: AtomicBool::new(dirty),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl GitOps for FakeGitOps {
        async fn current_commit(&self) -> Result<String> {
            Ok("0000000".to_string())
        }

        async fn has_uncommitted_changes(&self) -> Result<bool> {
            Ok(self.dirty.load(Ordering::SeqCst))
        }

        async fn create_pipeline_commit(
            &self,
            stage_name: &str,
            _run_id: &str,
            custom_message: Option<&str>,
            _template: Option<&str>,
        ) -> Result<String> {
            let mut next = self.next_sha.lock().unwrap();
            *next += 1;
            let sha = format!("{:07x}", *next);
            let message =
                custom_message.map(String::from).unwrap_or_else(|| format!("pipeline: {stage_name}"));
            self.commits.lock().unwrap().push(message);
            self.dirty.store(false, Ordering::SeqCst);
            Ok(sha)
        }

        async fn commit_message(&self, sha: &str) -> Result<String> {
            Ok(format!("commit {sha}"))
        }
    }
}
