//! agentpipe-core — the pipeline execution engine.
//!
//! Composes a DAG planner, a group orchestrator, a parallel executor, a stage
//! executor, and a top-level runner around a small set of capability traits
//! (`AgentRuntime`, `GitOps`, `PrOps`, `StateStore`, `HandoverStore`,
//! `ConditionEvaluator`, `NotificationDispatcher`) so every external
//! dependency — the LLM call, git, the filesystem, delivery channels — is
//! swappable and fake-able in tests.

pub mod agent_runtime;
pub mod condition;
pub mod context_reducer;
pub mod error;
pub mod git_ops;
pub mod graph;
pub mod group_orchestrator;
pub mod handover;
pub mod model;
pub mod notifications;
pub mod parallel_executor;
pub mod retry;
pub mod runner;
pub mod stage_executor;
pub mod state;
pub mod token;

pub use error::{Error, Result};
pub use model::{PipelineConfig, RunState, StageConfig, StageExecution, StageStatus};
pub use runner::{AbortHandle, PipelineRunner, RunOptions};
