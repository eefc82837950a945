//! `GitOps` and `PrOps` implementations backed by the `git` and `gh` CLIs.

pub mod client;
pub mod gitops;
pub mod worktree;

pub use client::GhPrOps;
pub use gitops::CliGitOps;
pub use worktree::{create_run_worktree, remove_worktree, Worktree, WorktreeStatus};
