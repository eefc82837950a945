//! Error types for agentpipe-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Pipeline config invalid, cycle, unknown dependency. Fatal before execution;
    /// the run is never started.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worktree creation, branch setup, or PR setup failure during initialization.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Git commit failed after a stage otherwise succeeded.
    #[error("Commit error: {0}")]
    Commit(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
