//! `PipelineRunner`: owns the run lifecycle (initialize → execute groups →
//! finalize), loop mode, and abort propagation. Composes every other
//! component in this crate; nothing here throws — the caller always gets
//! back a terminal `RunState`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent_runtime::{AgentRuntime, OutputSink};
use crate::git_ops::{GitOps, PrOps};
use crate::graph::build_execution_plan;
use crate::group_orchestrator::{GroupOrchestrator, StateChangeSink};
use crate::handover::HandoverStore;
use crate::model::{
    Artifacts, PipelineConfig, PullRequestArtifact, RunState, RunStatus, StageErrorDetail,
    StageExecution, StageStatus, Trigger,
};
use crate::notifications::{LifecycleEvent, NotificationDispatcher, NotificationEvent};
use crate::state::StateStore;

/// Cooperative cancellation flag threaded through the runner and every
/// suspension point it delegates to. Cloning shares the same underlying flag.
#[derive(Clone)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once `abort()` has been called; for runtimes that want to race
    /// against cancellation rather than poll `is_aborted()`.
    pub async fn cancelled(&self) {
        if self.is_aborted() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RunOptions {
    pub dry_run: bool,
    pub max_loop_iterations: u32,
    pub on_state_change: Option<StateChangeSink>,
    pub on_output: Option<OutputSink>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_loop_iterations: 1,
            on_state_change: None,
            on_output: None,
        }
    }
}

pub struct PipelineRunner {
    git: Arc<dyn GitOps>,
    pr: Option<Arc<dyn PrOps>>,
    handover: Arc<dyn HandoverStore>,
    state_store: Arc<dyn StateStore>,
    group_orchestrator: Arc<GroupOrchestrator>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    runtime: Arc<dyn AgentRuntime>,
}

impl PipelineRunner {
    pub fn new(
        git: Arc<dyn GitOps>,
        pr: Option<Arc<dyn PrOps>>,
        handover: Arc<dyn HandoverStore>,
        state_store: Arc<dyn StateStore>,
        group_orchestrator: Arc<GroupOrchestrator>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        Self {
            git,
            pr,
            handover,
            state_store,
            group_orchestrator,
            dispatcher,
            runtime,
        }
    }

    /// Runs a pipeline end-to-end once, or repeatedly under loop mode if
    /// `config.looping.enabled`. Always returns a terminal `RunState`.
    pub async fn run_pipeline(
        &self,
        config: PipelineConfig,
        options: RunOptions,
        abort: AbortHandle,
    ) -> RunState {
        if !config.looping.enabled {
            return self.run_once(config, &options, &abort).await;
        }

        let mut state = self.run_once(config.clone(), &options, &abort).await;
        let mut iteration = 1u32;

        loop {
            if state.status == RunStatus::Aborted {
                info!(iteration, "loop session ending: run aborted");
                break;
            }
            if state.status == RunStatus::Failed {
                info!(iteration, "loop session ending: run failed");
                break;
            }
            if iteration >= options.max_loop_iterations {
                info!(iteration, "loop session ending: reached max iterations");
                break;
            }

            let pending_empty = match tokio::fs::read_dir(&config.looping.directories.pending).await {
                Ok(mut entries) => entries.next_entry().await.ok().flatten().is_none(),
                Err(_) => true,
            };
            if pending_empty {
                info!(iteration, "no pending pipelines, exiting loop session");
                break;
            }

            iteration += 1;
            state = self.run_once(config.clone(), &options, &abort).await;
        }

        state
    }

    async fn run_once(&self, config: PipelineConfig, options: &RunOptions, abort: &AbortHandle) -> RunState {
        let mut state = match self.initialize(config, abort).await {
            Ok(state) => state,
            Err(e) => return self.finalize_initialization_failure(e, abort).await,
        };

        self.dispatcher
            .dispatch(NotificationEvent {
                event: LifecycleEvent::PipelineStarted,
                state: state.clone(),
                stage_name: None,
                detail: None,
            })
            .await;

        if abort.is_aborted() {
            state.status = RunStatus::Aborted;
            return self.finalize(state, options).await;
        }

        let graph = build_execution_plan(&state.pipeline_config);
        if !graph.validation.is_valid {
            error!(errors = ?graph.validation.errors, "execution plan invalid, aborting before any stage runs");
            state.status = RunStatus::Failed;
            state.stages.push(synthetic_failure(
                graph.validation.errors.join("; "),
            ));
            return self.finalize(state, options).await;
        }
        for warning in &graph.validation.warnings {
            warn!(warning, "execution plan warning");
        }

        let group_count = graph.plan.groups.len();
        for (index, group) in graph.plan.groups.iter().enumerate() {
            let outcome = self
                .group_orchestrator
                .execute_group(
                    group,
                    &mut state,
                    state.pipeline_config.settings.execution_mode,
                    state.pipeline_config.settings.failure_strategy,
                    self.runtime.clone(),
                    options.on_output.clone(),
                    options.on_state_change.clone(),
                    abort,
                )
                .await;

            let is_final_group = index + 1 == group_count;
            if outcome.should_stop {
                state.status = RunStatus::Failed;
                break;
            }
            if abort.is_aborted() {
                state.status = RunStatus::Aborted;
                break;
            }
            if is_final_group && state.status == RunStatus::Running {
                state.status = RunStatus::Completed;
            }
        }

        if state.status == RunStatus::Running {
            state.status = RunStatus::Completed;
        }

        self.finalize(state, options).await
    }

    // Worktree/branch setup is not performed here: `GitConfig` carries no
    // worktree-related fields, and `GitOps` exposes no worktree operations to
    // the engine. `agentpipe_git::worktree` is a standalone helper for callers
    // that want an isolated per-run checkout; wiring it into this lifecycle
    // would require extending `GitConfig` and the `GitOps` trait with a
    // worktree contract, which hasn't been specified.
    async fn initialize(&self, config: PipelineConfig, abort: &AbortHandle) -> crate::Result<RunState> {
        config.validate_name()?;
        let _ = abort;
        let initial_commit = self.git.current_commit().await?;
        let run_id = Uuid::new_v4();

        Ok(RunState {
            run_id,
            pipeline_config: config,
            trigger: Trigger {
                kind: "manual".to_string(),
                commit_sha: initial_commit.clone(),
                timestamp: Utc::now(),
            },
            stages: Vec::new(),
            status: RunStatus::Running,
            artifacts: Artifacts {
                initial_commit,
                final_commit: None,
                changed_files: Vec::new(),
                total_duration: 0.0,
                pull_request: None,
                handover_dir: self.handover.root_dir().to_string_lossy().into_owned(),
            },
        })
    }

    async fn finalize_initialization_failure(&self, error: crate::Error, abort: &AbortHandle) -> RunState {
        warn!(error = %error, "pipeline initialization failed");
        let run_id = Uuid::new_v4();
        let mut state = RunState {
            run_id,
            pipeline_config: PipelineConfig {
                name: "uninitialized".to_string(),
                trigger: crate::model::TriggerSource {
                    kind: "manual".to_string(),
                    branches: Vec::new(),
                },
                stages: Vec::new(),
                settings: Default::default(),
                git: Default::default(),
                pull_request: None,
                looping: Default::default(),
                context_reduction: Default::default(),
                notifications: Default::default(),
            },
            trigger: Trigger {
                kind: "manual".to_string(),
                commit_sha: String::new(),
                timestamp: Utc::now(),
            },
            stages: vec![synthetic_failure(error.to_string())],
            status: if abort.is_aborted() {
                RunStatus::Aborted
            } else {
                RunStatus::Failed
            },
            artifacts: Artifacts {
                initial_commit: String::new(),
                final_commit: None,
                changed_files: Vec::new(),
                total_duration: 0.0,
                pull_request: None,
                handover_dir: self.handover.root_dir().to_string_lossy().into_owned(),
            },
        };
        if let Err(e) = self.state_store.save(&state).await {
            warn!(error = %e, "failed to persist initialization-failure state");
        }
        state
    }

    async fn finalize(&self, mut state: RunState, options: &RunOptions) -> RunState {
        let total_duration: f64 = state.stages.iter().filter_map(|s| s.duration).sum();
        state.artifacts.total_duration = total_duration;

        match self.git.current_commit().await {
            Ok(sha) => state.artifacts.final_commit = Some(sha),
            Err(e) => warn!(error = %e, "failed to capture final commit"),
        }

        if let (Some(pr_config), Some(pr_ops), false) = (
            &state.pipeline_config.pull_request,
            &self.pr,
            options.dry_run,
        ) {
            let branch = format!("agentpipe/{}", state.run_id);
            match pr_ops
                .create_pr(
                    &branch,
                    &pr_config.base,
                    &format!("{}: run {}", state.pipeline_config.name, state.run_id),
                    "Automated pipeline run.",
                    pr_config.draft,
                )
                .await
            {
                Ok(handle) => {
                    state.artifacts.pull_request = Some(PullRequestArtifact {
                        url: handle.url,
                        number: handle.number,
                    });
                    self.dispatcher
                        .dispatch(NotificationEvent {
                            event: LifecycleEvent::PrCreated,
                            state: state.clone(),
                            stage_name: None,
                            detail: None,
                        })
                        .await;
                }
                Err(e) => warn!(error = %e, "failed to create pull request"),
            }
        }

        if let Err(e) = self.state_store.save(&state).await {
            warn!(error = %e, "failed to persist final run state");
        }

        let event = match state.status {
            RunStatus::Failed => LifecycleEvent::PipelineFailed,
            _ => LifecycleEvent::PipelineCompleted,
        };
        self.dispatcher
            .dispatch(NotificationEvent {
                event,
                state: state.clone(),
                stage_name: None,
                detail: None,
            })
            .await;

        if let Some(sink) = &options.on_state_change {
            sink(&state);
        }

        info!(
            run_id = %state.run_id,
            status = state.status.as_str(),
            duration = state.artifacts.total_duration,
            "pipeline run finalized"
        );
        state
    }
}

fn synthetic_failure(message: String) -> StageExecution {
    let now = Utc::now();
    StageExecution {
        status: StageStatus::Failed,
        start_time: Some(now),
        end_time: Some(now),
        duration: Some(0.0),
        error: Some(StageErrorDetail {
            message,
            stack: None,
            suggestion: None,
            agent_path: None,
            timestamp: now,
        }),
        ..StageExecution::pending("__initialization__")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_runtime::fakes::FakeAgentRuntime;
    use crate::condition::FakeConditionEvaluator;
    use crate::context_reducer::ContextReducer;
    use crate::git_ops::fakes::FakeGitOps;
    use crate::handover::FileHandoverStore;
    use crate::model::{RetryConfig, StageConfig, TriggerSource};
    use crate::notifications::FanOutDispatcher;
    use crate::parallel_executor::ParallelExecutor;
    use crate::stage_executor::StageExecutor;
    use crate::state::FileStateStore;
    use std::collections::{HashMap, HashSet};

    fn stage(name: &str, agent_path: &str) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            agent: agent_path.to_string(),
            depends_on: HashSet::new(),
            enabled: true,
            condition: None,
            on_fail: None,
            timeout: 5,
            retry: RetryConfig {
                max_attempts: 1,
                backoff: 1,
            },
            inputs: HashMap::new(),
            runtime: None,
            auto_commit: None,
        }
    }

    fn config(name: &str, stages: Vec<StageConfig>) -> PipelineConfig {
        PipelineConfig {
            name: name.to_string(),
            trigger: TriggerSource {
                kind: "manual".into(),
                branches: vec![],
            },
            stages,
            settings: Default::default(),
            git: Default::default(),
            pull_request: None,
            looping: Default::default(),
            context_reduction: Default::default(),
            notifications: Default::default(),
        }
    }

    fn runner(dir: &std::path::Path) -> PipelineRunner {
        let handover = Arc::new(FileHandoverStore::new(dir, Uuid::new_v4()));
        let git = Arc::new(FakeGitOps::default());
        let stage_executor = Arc::new(StageExecutor::new(handover.clone(), git.clone()));
        let parallel = Arc::new(ParallelExecutor::new(stage_executor));
        let reducer = Arc::new(ContextReducer::new(handover.clone()));
        let state_store = Arc::new(FileStateStore::new(dir));
        let dispatcher = Arc::new(FanOutDispatcher::new(vec![]));
        let group_orchestrator = Arc::new(GroupOrchestrator::new(
            Arc::new(FakeConditionEvaluator::default()),
            reducer,
            parallel,
            state_store.clone(),
            dispatcher.clone(),
        ));
        let runtime: Arc<dyn AgentRuntime> = Arc::new(FakeAgentRuntime::succeeding("done"));
        PipelineRunner::new(git, None, handover, state_store, group_orchestrator, dispatcher, runtime)
    }

    #[tokio::test]
    async fn sequential_two_stage_pipeline_completes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b"] {
            tokio::fs::write(dir.path().join(format!("{name}.md")), "prompt")
                .await
                .unwrap();
        }
        let runner = runner(dir.path());
        let cfg = config(
            "demo",
            vec![
                stage("a", dir.path().join("a.md").to_str().unwrap()),
                stage("b", dir.path().join("b.md").to_str().unwrap()),
            ],
        );

        let state = runner
            .run_pipeline(cfg, RunOptions::default(), AbortHandle::new())
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.stages.len(), 2);
        assert!(state.stages.iter().all(|s| s.status == StageStatus::Success));
    }

    #[tokio::test]
    async fn pre_aborted_run_never_executes_a_stage() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.md"), "prompt").await.unwrap();
        let runner = runner(dir.path());
        let cfg = config("demo", vec![stage("a", dir.path().join("a.md").to_str().unwrap())]);
        let abort = AbortHandle::new();
        abort.abort();

        let state = runner.run_pipeline(cfg, RunOptions::default(), abort).await;
        assert_eq!(state.status, RunStatus::Aborted);
        assert!(state.stages.is_empty());
    }

    #[tokio::test]
    async fn invalid_plan_fails_before_any_stage_runs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let cfg = config(
            "demo",
            vec![stage("a", "agents/a.md"), stage("a", "agents/a.md")],
        );

        let state = runner
            .run_pipeline(cfg, RunOptions::default(), AbortHandle::new())
            .await;
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stages.len(), 1);
    }
}
