//! `StageExecutor`: runs one stage to completion. Never panics or propagates an
//! error — every outcome, including failure, is returned as a `StageExecution`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{info, warn};

use crate::agent_runtime::{AgentRequest, AgentRuntime, OutputSink};
use crate::git_ops::GitOps;
use crate::handover::{HandoverStore, StageOutput};
use crate::model::{
    GitConfig, RunState, StageConfig, StageErrorDetail, StageExecution, StageStatus, TokenUsage,
};
use crate::runner::AbortHandle;

pub struct StageExecutor {
    handover: Arc<dyn HandoverStore>,
    git: Arc<dyn GitOps>,
}

impl StageExecutor {
    pub fn new(handover: Arc<dyn HandoverStore>, git: Arc<dyn GitOps>) -> Self {
        Self { handover, git }
    }

    pub async fn execute_stage(
        &self,
        stage: &StageConfig,
        state: &RunState,
        runtime: &dyn AgentRuntime,
        on_output: Option<OutputSink>,
        abort: &AbortHandle,
    ) -> StageExecution {
        let start_time = Utc::now();
        let mut execution = StageExecution::pending(stage.name.clone());
        execution.status = StageStatus::Running;
        execution.start_time = Some(start_time);
        execution.max_retries = stage.retry.max_attempts.saturating_sub(1);

        let context = match self.build_context(stage, state).await {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(execution, start_time, stage, &e.to_string()),
        };

        let prompt = match tokio::fs::read_to_string(&stage.agent).await {
            Ok(p) => p,
            Err(e) => {
                return self.fail(
                    execution,
                    start_time,
                    stage,
                    &format!("failed to read agent file '{}': {e}", stage.agent),
                )
            }
        };

        let request = AgentRequest {
            system_prompt: prompt,
            user_prompt: context,
            permission_mode: state.pipeline_config.settings.permission_mode,
            model: stage.runtime.clone(),
        };

        let timeout = StdDuration::from_secs(stage.timeout);
        let outcome = tokio::time::timeout(timeout, runtime.execute(request, on_output, abort)).await;

        let response = match outcome {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return self.fail(execution, start_time, stage, &e.to_string()),
            Err(_) => {
                return self.fail(
                    execution,
                    start_time,
                    stage,
                    &format!("stage '{}' exceeded its timeout of {}s", stage.name, stage.timeout),
                )
            }
        };

        execution.agent_output = Some(response.text_output.clone());
        execution.token_usage = Some(TokenUsage {
            input: response.token_usage.input,
            output: response.token_usage.output,
            total: response.token_usage.total,
            cache_read: response.token_usage.cache_read,
            cache_write: response.token_usage.cache_write,
        });

        match self
            .handover
            .save(
                &stage.name,
                StageOutput {
                    raw_text: &response.text_output,
                    structured: response.extracted_data.as_ref(),
                },
            )
            .await
        {
            Ok(files) => execution.output_files = Some(files),
            Err(e) => warn!(stage = %stage.name, error = %e, "failed to persist handover output"),
        }

        let auto_commit = stage
            .auto_commit
            .unwrap_or(state.pipeline_config.git.auto_commit);
        if auto_commit {
            if let Err(e) = self.maybe_commit(&state.pipeline_config.git, stage, &state.run_id.to_string(), &mut execution).await {
                warn!(stage = %stage.name, error = %e, "commit step failed");
            }
        }

        let end_time = Utc::now();
        execution.end_time = Some(end_time);
        execution.duration = Some((end_time - start_time).num_milliseconds().max(0) as f64 / 1000.0);
        execution.status = StageStatus::Success;
        info!(stage = %stage.name, duration = execution.duration, "stage completed");
        execution
    }

    async fn maybe_commit(
        &self,
        git_config: &GitConfig,
        stage: &StageConfig,
        run_id: &str,
        execution: &mut StageExecution,
    ) -> crate::Result<()> {
        let dirty = self.git.has_uncommitted_changes().await?;
        if git_config.dry_run {
            return Ok(());
        }
        if !dirty {
            return Ok(());
        }
        let sha = self
            .git
            .create_pipeline_commit(
                &stage.name,
                run_id,
                None,
                git_config.commit_message_template.as_deref(),
            )
            .await
            .map_err(|e| crate::Error::Commit(e.to_string()))?;
        let message = self.git.commit_message(&sha).await.unwrap_or_default();
        execution.commit_sha = Some(sha);
        execution.commit_message = Some(message);
        Ok(())
    }

    /// Builds the agent's user-prompt context: run header, previous-stage
    /// references (file paths, not inlined bodies), declared inputs, and the
    /// handover directory path.
    async fn build_context(&self, stage: &StageConfig, state: &RunState) -> crate::Result<String> {
        let mut ctx = String::new();
        ctx.push_str(&format!("## Pipeline Run ID\n{}\n\n", state.run_id));
        ctx.push_str(&format!("## Trigger Commit\n{}\n\n", state.trigger.commit_sha));

        let previous = self.handover.previous_stages().await?;
        if !previous.is_empty() {
            ctx.push_str("## Previous Stage Outputs\n");
            for prev in &previous {
                ctx.push_str(&format!(
                    "- {}: structured={}, raw={}\n",
                    prev.stage_name,
                    prev.structured_path.display(),
                    prev.raw_path.display()
                ));
            }
            ctx.push('\n');
        }

        if !stage.inputs.is_empty() {
            ctx.push_str("## Inputs\n");
            for (key, value) in &stage.inputs {
                ctx.push_str(&format!("**{key}**: {value}\n"));
            }
            ctx.push('\n');
        }

        ctx.push_str(&format!(
            "## Handover Directory\n{}\n",
            self.handover.root_dir().display()
        ));

        Ok(ctx)
    }

    fn fail(
        &self,
        mut execution: StageExecution,
        start_time: chrono::DateTime<Utc>,
        stage: &StageConfig,
        message: &str,
    ) -> StageExecution {
        let end_time = Utc::now();
        execution.end_time = Some(end_time);
        execution.duration = Some((end_time - start_time).num_milliseconds().max(0) as f64 / 1000.0);
        execution.status = StageStatus::Failed;
        execution.error = Some(StageErrorDetail {
            message: message.to_string(),
            stack: None,
            suggestion: classify_error(message, &stage.agent),
            agent_path: Some(stage.agent.clone()),
            timestamp: end_time,
        });
        warn!(stage = %stage.name, error = message, "stage failed");
        execution
    }
}

/// Matches `captureErrorDetails` in the component design: substring heuristics
/// over the error message produce an actionable suggestion.
fn classify_error(message: &str, agent_path: &str) -> Option<String> {
    let lower = message.to_lowercase();
    if lower.contains("enoent") || lower.contains("file not found") || lower.contains("failed to read agent file") {
        Some(format!("Agent file not found: {agent_path} — check the path"))
    } else if lower.contains("timeout") {
        Some("Stage exceeded timeout; raise `timeout` in pipeline config".to_string())
    } else if lower.contains("401") || lower.contains("api") {
        Some("Check ANTHROPIC_API_KEY".to_string())
    } else if lower.contains("yaml") {
        Some("Check YAML syntax in agent definition".to_string())
    } else if lower.contains("permission") {
        Some("File permission problem".to_string())
    } else {
        None
    }
}
