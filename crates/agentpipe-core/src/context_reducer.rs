//! `ContextReducer`: detects oversized accumulated context ahead of a stage and,
//! if configured, runs a reducer agent to compress it before that stage executes.
//! Failure here is never fatal to the pipeline — it is logged and the run
//! proceeds with the full, unreduced context.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::agent_runtime::{AgentRequest, AgentRuntime};
use crate::handover::HandoverStore;
use crate::model::{
    ContextReductionConfig, ContextReductionStrategy, PermissionMode, RunState, StageExecution,
    StageStatus,
};
use crate::retry::retry_with_backoff;
use crate::runner::AbortHandle;
use crate::token::TokenEstimator;

const REDUCTION_RETRY_ATTEMPTS: u32 = 2;
const REDUCTION_RETRY_BACKOFF_SECS: u64 = 2;

pub struct ContextReducer {
    handover: Arc<dyn HandoverStore>,
    estimator: TokenEstimator,
}

impl ContextReducer {
    pub fn new(handover: Arc<dyn HandoverStore>) -> Self {
        Self {
            handover,
            estimator: TokenEstimator::new(),
        }
    }

    /// Sums the raw-output size of every previously recorded stage as a proxy
    /// for how much context the next stage invocation would carry.
    pub async fn estimate_accumulated_tokens(&self, state: &RunState) -> crate::Result<u64> {
        let mut total = 0u64;
        for stage in &state.stages {
            if let Some(output) = &stage.agent_output {
                total += self.estimator.estimate_text(output);
            }
        }
        Ok(total)
    }

    /// True once accumulated tokens cross 90% of the configured ceiling.
    pub fn should_reduce(&self, config: &ContextReductionConfig, accumulated_tokens: u64) -> bool {
        if !config.enabled {
            return false;
        }
        let threshold = (config.max_tokens as f64 * 0.9) as u64;
        accumulated_tokens >= threshold
    }

    /// Runs the reducer agent and returns a `StageExecution` recorded under
    /// `RunState::REDUCER_STAGE_NAME`, ready to be spliced into `state.stages`.
    pub async fn run_reduction(
        &self,
        config: &ContextReductionConfig,
        runtime: &dyn AgentRuntime,
        abort: &AbortHandle,
    ) -> StageExecution {
        let start_time = Utc::now();
        let mut execution = StageExecution::pending(RunState::REDUCER_STAGE_NAME);
        execution.status = StageStatus::Running;
        execution.start_time = Some(start_time);

        if !matches!(config.strategy, ContextReductionStrategy::AgentBased) {
            return self.skip(execution, start_time, "summary-based reduction requires no agent call");
        }

        let Some(agent_path) = &config.agent_path else {
            return self.fail(execution, start_time, "contextReduction.agentPath is not configured");
        };

        let prompt = match tokio::fs::read_to_string(agent_path).await {
            Ok(p) => p,
            Err(e) => {
                return self.fail(
                    execution,
                    start_time,
                    &format!("failed to read reducer agent '{agent_path}': {e}"),
                )
            }
        };

        let previous = match self.handover.previous_stages().await {
            Ok(p) => p,
            Err(e) => return self.fail(execution, start_time, &e.to_string()),
        };

        let mut context = String::from("## Summarize and compress the following stage outputs\n\n");
        for stage in &previous {
            context.push_str(&format!(
                "- {}: {}\n",
                stage.stage_name,
                stage.raw_path.display()
            ));
        }

        let request = AgentRequest {
            system_prompt: prompt,
            user_prompt: context,
            permission_mode: PermissionMode::Default,
            model: None,
        };

        let (outcome, attempts) = retry_with_backoff(
            &crate::model::RetryConfig {
                max_attempts: REDUCTION_RETRY_ATTEMPTS,
                backoff: REDUCTION_RETRY_BACKOFF_SECS,
            },
            || {
                let request = request.clone();
                async move { runtime.execute(request, None, abort).await }
            },
        )
        .await;

        execution.retry_attempt = attempts.saturating_sub(1);
        match outcome {
            Ok(response) => {
                if let Err(e) = self
                    .handover
                    .save(
                        RunState::REDUCER_STAGE_NAME,
                        crate::handover::StageOutput {
                            raw_text: &response.text_output,
                            structured: None,
                        },
                    )
                    .await
                {
                    warn!(error = %e, "failed to persist reduced context");
                }
                let end_time = Utc::now();
                execution.end_time = Some(end_time);
                execution.duration =
                    Some((end_time - start_time).num_milliseconds().max(0) as f64 / 1000.0);
                execution.status = StageStatus::Success;
                execution.agent_output = Some(response.text_output);
                info!("context reduction completed after {attempts} attempt(s)");
                execution
            }
            Err(e) => self.fail(execution, start_time, &e.to_string()),
        }
    }

    fn skip(&self, mut execution: StageExecution, start_time: chrono::DateTime<Utc>, reason: &str) -> StageExecution {
        let end_time = Utc::now();
        execution.end_time = Some(end_time);
        execution.duration = Some((end_time - start_time).num_milliseconds().max(0) as f64 / 1000.0);
        execution.status = StageStatus::Skipped;
        execution.agent_output = Some(reason.to_string());
        execution
    }

    fn fail(&self, mut execution: StageExecution, start_time: chrono::DateTime<Utc>, message: &str) -> StageExecution {
        let end_time = Utc::now();
        execution.end_time = Some(end_time);
        execution.duration = Some((end_time - start_time).num_milliseconds().max(0) as f64 / 1000.0);
        execution.status = StageStatus::Failed;
        execution.error = Some(crate::model::StageErrorDetail {
            message: message.to_string(),
            stack: None,
            suggestion: Some("context reduction failed; the pipeline continues with full context".to_string()),
            agent_path: None,
            timestamp: end_time,
        });
        warn!(error = message, "context reduction failed, continuing with full context");
        execution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_runtime::fakes::FakeAgentRuntime;
    use crate::handover::FileHandoverStore;
    use uuid::Uuid;

    fn config(agent_path: Option<String>) -> ContextReductionConfig {
        ContextReductionConfig {
            enabled: true,
            strategy: ContextReductionStrategy::AgentBased,
            max_tokens: 1000,
            agent_path,
        }
    }

    #[test]
    fn should_reduce_at_ninety_percent_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let handover = Arc::new(FileHandoverStore::new(dir.path(), Uuid::new_v4()));
        let reducer = ContextReducer::new(handover);
        let cfg = config(None);
        assert!(!reducer.should_reduce(&cfg, 800));
        assert!(reducer.should_reduce(&cfg, 900));
    }

    #[test]
    fn disabled_config_never_triggers_reduction() {
        let dir = tempfile::tempdir().unwrap();
        let handover = Arc::new(FileHandoverStore::new(dir.path(), Uuid::new_v4()));
        let reducer = ContextReducer::new(handover);
        let mut cfg = config(None);
        cfg.enabled = false;
        assert!(!reducer.should_reduce(&cfg, 10_000));
    }

    #[tokio::test]
    async fn missing_agent_path_fails_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let handover = Arc::new(FileHandoverStore::new(dir.path(), Uuid::new_v4()));
        let reducer = ContextReducer::new(handover);
        let runtime = FakeAgentRuntime::succeeding("summary");
        let abort = AbortHandle::new();
        let cfg = config(None);

        let execution = reducer.run_reduction(&cfg, &runtime, &abort).await;
        assert_eq!(execution.status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn successful_reduction_saves_output_under_sentinel_name() {
        let dir = tempfile::tempdir().unwrap();
        let agent_path = dir.path().join("reducer.md");
        tokio::fs::write(&agent_path, "summarize").await.unwrap();
        let handover = Arc::new(FileHandoverStore::new(dir.path(), Uuid::new_v4()));
        let reducer = ContextReducer::new(handover);
        let runtime = FakeAgentRuntime::succeeding("condensed summary");
        let abort = AbortHandle::new();
        let cfg = config(Some(agent_path.to_str().unwrap().to_string()));

        let execution = reducer.run_reduction(&cfg, &runtime, &abort).await;
        assert_eq!(execution.status, StageStatus::Success);
        assert_eq!(execution.stage_name, RunState::REDUCER_STAGE_NAME);
    }
}
