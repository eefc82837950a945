//! Pipeline domain model: the types every other module in this crate operates on.
//!
//! Field names use `camelCase` on the wire so `RunState` round-trips against the
//! on-disk JSON schema unchanged; in-memory field names stay `snake_case` per
//! convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

// ==================== Pipeline Config ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub name: String,
    pub trigger: TriggerSource,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub pull_request: Option<PullRequestConfig>,
    #[serde(default)]
    pub looping: LoopingConfig,
    #[serde(default)]
    pub context_reduction: ContextReductionConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

impl PipelineConfig {
    /// `name` must be a filesystem-safe token: ASCII alphanumerics, `-` and `_` only.
    pub fn validate_name(&self) -> Result<()> {
        let safe = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if safe {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "pipeline name '{}' is not filesystem-safe",
                self.name
            )))
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: PermissionMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            failure_strategy: FailureStrategy::default(),
            permission_mode: default_permission_mode(),
        }
    }
}

fn default_permission_mode() -> PermissionMode {
    PermissionMode::AcceptEdits
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Sequential
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStrategy {
    Stop,
    Warn,
    Continue,
}

impl Default for FailureStrategy {
    fn default() -> Self {
        FailureStrategy::Stop
    }
}

impl FromStr for FailureStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stop" => Ok(FailureStrategy::Stop),
            "warn" => Ok(FailureStrategy::Warn),
            "continue" => Ok(FailureStrategy::Continue),
            _ => Err(Error::Configuration(format!(
                "invalid failure strategy: {s}"
            ))),
        }
    }
}

impl FailureStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStrategy::Stop => "stop",
            FailureStrategy::Warn => "warn",
            FailureStrategy::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    #[serde(default)]
    pub auto_commit: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub commit_message_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestConfig {
    pub base: String,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directories: LoopingDirectories,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopingDirectories {
    #[serde(default = "default_pending_dir")]
    pub pending: String,
}

fn default_pending_dir() -> String {
    ".agent-pipeline/loops/default/pending".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextReductionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: ContextReductionStrategy,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub agent_path: Option<String>,
}

impl Default for ContextReductionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: ContextReductionStrategy::default(),
            max_tokens: default_max_tokens(),
            agent_path: None,
        }
    }
}

fn default_max_tokens() -> u64 {
    50_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextReductionStrategy {
    AgentBased,
    SummaryBased,
}

impl Default for ContextReductionStrategy {
    fn default() -> Self {
        ContextReductionStrategy::AgentBased
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsConfig {
    #[serde(default)]
    pub channels: Vec<crate::notifications::ChannelConfig>,
}

// ==================== Stage Config ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub name: String,
    pub agent: String,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_fail: Option<FailureStrategy>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub auto_commit: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    900
}

impl StageConfig {
    /// Effective failure strategy: stage override, else pipeline default, else `stop`.
    pub fn effective_failure_strategy(&self, pipeline_default: FailureStrategy) -> FailureStrategy {
        self.on_fail.unwrap_or(pipeline_default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_secs() -> u64 {
    1
}

// ==================== Execution Graph ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionGroup {
    pub level: usize,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub groups: Vec<ExecutionGroup>,
    pub max_parallelism: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub plan: ExecutionPlan,
    pub validation: PlanValidation,
}

// ==================== Stage Execution / Run State ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Aborted,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Success => "success",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageErrorDetail {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub agent_path: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    #[serde(default)]
    pub cache_read: Option<u64>,
    #[serde(default)]
    pub cache_write: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFiles {
    pub structured: String,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    pub stage_name: String,
    pub status: StageStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub agent_output: Option<String>,
    #[serde(default)]
    pub error: Option<StageErrorDetail>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub condition_evaluated: bool,
    #[serde(default)]
    pub condition_result: Option<bool>,
    #[serde(default)]
    pub output_files: Option<OutputFiles>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

impl StageExecution {
    pub fn pending(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Pending,
            start_time: None,
            end_time: None,
            duration: None,
            commit_sha: None,
            commit_message: None,
            agent_output: None,
            error: None,
            retry_attempt: 0,
            max_retries: 0,
            condition_evaluated: false,
            condition_result: None,
            output_files: None,
            token_usage: None,
        }
    }

    pub fn skipped(stage_name: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            ..Self::pending(stage_name)
        }
    }

    pub fn skipped_condition(stage_name: impl Into<String>, result: bool) -> Self {
        Self {
            condition_evaluated: true,
            condition_result: Some(result),
            ..Self::skipped(stage_name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Partial,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(rename = "type")]
    pub kind: String,
    pub commit_sha: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestArtifact {
    pub url: String,
    pub number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifacts {
    pub initial_commit: String,
    #[serde(default)]
    pub final_commit: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub total_duration: f64,
    #[serde(default)]
    pub pull_request: Option<PullRequestArtifact>,
    pub handover_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: Uuid,
    pub pipeline_config: PipelineConfig,
    pub trigger: Trigger,
    #[serde(default)]
    pub stages: Vec<StageExecution>,
    pub status: RunStatus,
    pub artifacts: Artifacts,
}

impl RunState {
    /// Reducer sentinel stage name, per the glossary's "reducer stage" definition.
    pub const REDUCER_STAGE_NAME: &'static str = "__context_reducer__";

    pub fn find_stage(&self, name: &str) -> Option<&StageExecution> {
        self.stages.iter().rev().find(|s| s.stage_name == name)
    }
}
