//! `ParallelExecutor`: runs every stage within one execution-graph level,
//! concurrently when the pipeline is configured for parallel execution and
//! one-at-a-time otherwise. Per-stage retries live here, not in `StageExecutor`,
//! since retrying is a group-level concern (it must not block siblings).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::agent_runtime::{AgentRuntime, OutputSink};
use crate::model::{FailureStrategy, RunState, StageConfig, StageExecution, StageStatus};
use crate::runner::AbortHandle;
use crate::stage_executor::StageExecutor;

const MAX_BACKOFF_SECS: u64 = 30;

pub struct ParallelExecutor {
    stage_executor: Arc<StageExecutor>,
}

impl ParallelExecutor {
    pub fn new(stage_executor: Arc<StageExecutor>) -> Self {
        Self { stage_executor }
    }

    /// Runs every stage in `stages` concurrently. The returned vector preserves
    /// `stages`' input order regardless of completion order.
    pub async fn execute_parallel_group(
        &self,
        stages: &[StageConfig],
        state: &RunState,
        runtime: Arc<dyn AgentRuntime>,
        on_output: Option<OutputSink>,
        abort: &AbortHandle,
    ) -> Vec<StageExecution> {
        let mut handles = Vec::with_capacity(stages.len());
        for stage in stages {
            let executor = self.stage_executor.clone();
            let stage = stage.clone();
            let state = state.clone();
            let runtime = runtime.clone();
            let on_output = on_output.clone();
            let abort = abort.clone();
            handles.push(tokio::spawn(async move {
                run_with_retries(&executor, &stage, &state, runtime.as_ref(), on_output, &abort).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (stage, handle) in stages.iter().zip(handles) {
            match handle.await {
                Ok(execution) => results.push(execution),
                Err(join_err) => {
                    let mut execution = StageExecution::pending(stage.name.clone());
                    execution.status = StageStatus::Failed;
                    execution.error = Some(crate::model::StageErrorDetail {
                        message: format!("stage task panicked: {join_err}"),
                        stack: None,
                        suggestion: None,
                        agent_path: Some(stage.agent.clone()),
                        timestamp: chrono::Utc::now(),
                    });
                    results.push(execution);
                }
            }
        }
        results
    }

    /// Runs every stage in `stages` one at a time, in declaration order.
    /// Stops dispatching further stages once either the run is aborted or a
    /// stage fails with an effective `stop` failure strategy — stages after
    /// that point are omitted from the returned vec entirely.
    pub async fn execute_sequential_group(
        &self,
        stages: &[StageConfig],
        state: &RunState,
        runtime: Arc<dyn AgentRuntime>,
        on_output: Option<OutputSink>,
        abort: &AbortHandle,
        pipeline_failure_strategy: FailureStrategy,
    ) -> Vec<StageExecution> {
        let mut results = Vec::with_capacity(stages.len());
        for stage in stages {
            if abort.is_aborted() {
                break;
            }
            let execution = run_with_retries(
                &self.stage_executor,
                stage,
                state,
                runtime.as_ref(),
                on_output.clone(),
                abort,
            )
            .await;
            let stop = execution.status == StageStatus::Failed
                && stage.effective_failure_strategy(pipeline_failure_strategy) == FailureStrategy::Stop;
            results.push(execution);
            if stop {
                break;
            }
        }
        results
    }
}

async fn run_with_retries(
    executor: &StageExecutor,
    stage: &StageConfig,
    state: &RunState,
    runtime: &dyn AgentRuntime,
    on_output: Option<OutputSink>,
    abort: &AbortHandle,
) -> StageExecution {
    let max_attempts = stage.retry.max_attempts.max(1);
    let mut backoff = Duration::from_secs(stage.retry.backoff.max(1));
    let mut attempt = 0;

    loop {
        attempt += 1;
        let mut execution = executor
            .execute_stage(stage, state, runtime, on_output.clone(), abort)
            .await;
        execution.retry_attempt = attempt - 1;
        execution.max_retries = max_attempts - 1;

        if execution.status != StageStatus::Failed || attempt >= max_attempts {
            return execution;
        }
        if abort.is_aborted() {
            info!(stage = %stage.name, "stage failed during abort, not retrying");
            return execution;
        }
        info!(
            stage = %stage.name,
            attempt,
            max_attempts,
            "stage failed, retrying after backoff"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub any_failed: bool,
}

/// Pure summary over a completed group's executions — stable under reordering.
pub fn aggregate_results(executions: &[StageExecution]) -> GroupSummary {
    let mut summary = GroupSummary {
        total: executions.len(),
        ..Default::default()
    };
    for execution in executions {
        match execution.status {
            StageStatus::Success => summary.succeeded += 1,
            StageStatus::Failed | StageStatus::Aborted => {
                summary.failed += 1;
                summary.any_failed = true;
            }
            StageStatus::Skipped => summary.skipped += 1,
            StageStatus::Pending | StageStatus::Running => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_runtime::fakes::FakeAgentRuntime;
    use crate::git_ops::fakes::FakeGitOps;
    use crate::handover::FileHandoverStore;
    use crate::model::{
        Artifacts, PipelineConfig, RetryConfig, RunStatus, Settings, Trigger, TriggerSource,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn stage(name: &str, agent_path: &str, max_attempts: u32) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            agent: agent_path.to_string(),
            depends_on: HashSet::new(),
            enabled: true,
            condition: None,
            on_fail: None,
            timeout: 5,
            retry: RetryConfig {
                max_attempts,
                backoff: 1,
            },
            inputs: HashMap::new(),
            runtime: None,
            auto_commit: None,
        }
    }

    fn state() -> RunState {
        RunState {
            run_id: Uuid::new_v4(),
            pipeline_config: PipelineConfig {
                name: "test".into(),
                trigger: TriggerSource {
                    kind: "manual".into(),
                    branches: vec![],
                },
                stages: vec![],
                settings: Settings::default(),
                git: Default::default(),
                pull_request: None,
                looping: Default::default(),
                context_reduction: Default::default(),
                notifications: Default::default(),
            },
            trigger: Trigger {
                kind: "manual".into(),
                commit_sha: "abc123".into(),
                timestamp: chrono::Utc::now(),
            },
            stages: vec![],
            status: RunStatus::Running,
            artifacts: Artifacts {
                initial_commit: "abc123".into(),
                final_commit: None,
                changed_files: vec![],
                total_duration: 0.0,
                pull_request: None,
                handover_dir: "/tmp".into(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_group_preserves_input_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            tokio::fs::write(dir.path().join(format!("{name}.md")), "prompt")
                .await
                .unwrap();
        }
        let handover = Arc::new(FileHandoverStore::new(dir.path(), Uuid::new_v4()));
        let git = Arc::new(FakeGitOps::default());
        let executor = Arc::new(StageExecutor::new(handover, git));
        let parallel = ParallelExecutor::new(executor);
        let runtime: Arc<dyn AgentRuntime> = Arc::new(FakeAgentRuntime::succeeding("ok"));
        let abort = AbortHandle::new();

        let stages = vec![
            stage("a", dir.path().join("a.md").to_str().unwrap(), 1),
            stage("b", dir.path().join("b.md").to_str().unwrap(), 1),
            stage("c", dir.path().join("c.md").to_str().unwrap(), 1),
        ];

        let results = parallel
            .execute_parallel_group(&stages, &state(), runtime, None, &abort)
            .await;
        let names: Vec<_> = results.iter().map(|e| e.stage_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_stage_up_to_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let agent_path = dir.path().join("agent.md");
        tokio::fs::write(&agent_path, "prompt").await.unwrap();
        let handover = Arc::new(FileHandoverStore::new(dir.path(), Uuid::new_v4()));
        let git = Arc::new(FakeGitOps::default());
        let executor = Arc::new(StageExecutor::new(handover, git));
        let runtime: Arc<dyn AgentRuntime> = Arc::new(FakeAgentRuntime::failing("boom"));
        let abort = AbortHandle::new();
        let stage_cfg = stage("flaky", agent_path.to_str().unwrap(), 3);

        let execution = run_with_retries(
            &executor,
            &stage_cfg,
            &state(),
            runtime.as_ref(),
            None,
            &abort,
        )
        .await;

        assert_eq!(execution.status, StageStatus::Failed);
        assert_eq!(execution.retry_attempt, 2);
    }

    #[test]
    fn aggregate_counts_by_status() {
        let executions = vec![
            StageExecution {
                status: StageStatus::Success,
                ..StageExecution::pending("a")
            },
            StageExecution {
                status: StageStatus::Failed,
                ..StageExecution::pending("b")
            },
            StageExecution::skipped("c"),
        ];
        let summary = aggregate_results(&executions);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.any_failed);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_group_runs_in_declared_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["first", "second"] {
            tokio::fs::write(dir.path().join(format!("{name}.md")), "prompt")
                .await
                .unwrap();
        }
        let handover = Arc::new(FileHandoverStore::new(dir.path(), Uuid::new_v4()));
        let git = Arc::new(FakeGitOps::default());
        let executor = Arc::new(StageExecutor::new(handover, git));
        let parallel = ParallelExecutor::new(executor);
        let calls = Arc::new(AtomicUsize::new(0));
        let runtime: Arc<dyn AgentRuntime> = Arc::new(FakeAgentRuntime::succeeding("ok"));
        let abort = AbortHandle::new();
        let _ = &calls;

        let stages = vec![
            stage("first", dir.path().join("first.md").to_str().unwrap(), 1),
            stage("second", dir.path().join("second.md").to_str().unwrap(), 1),
        ];
        let results = parallel
            .execute_sequential_group(
                &stages,
                &state(),
                runtime,
                None,
                &abort,
                FailureStrategy::Stop,
            )
            .await;
        assert_eq!(results[0].stage_name, "first");
        assert_eq!(results[1].stage_name, "second");
    }
}
