//! End-to-end scenarios driven through `PipelineRunner`, exercising the
//! group orchestrator, planner, and stage executor together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agentpipe_core::agent_runtime::fakes::FakeAgentRuntime;
use agentpipe_core::agent_runtime::{AgentRequest, AgentResponse, AgentRuntime, OutputSink};
use agentpipe_core::condition::TemplateConditionEvaluator;
use agentpipe_core::context_reducer::ContextReducer;
use agentpipe_core::git_ops::fakes::FakeGitOps;
use agentpipe_core::group_orchestrator::GroupOrchestrator;
use agentpipe_core::handover::FileHandoverStore;
use agentpipe_core::model::{
    ExecutionMode, FailureStrategy, GitConfig, PipelineConfig, RetryConfig, RunStatus, Settings,
    StageConfig, TriggerSource,
};
use agentpipe_core::notifications::FanOutDispatcher;
use agentpipe_core::parallel_executor::ParallelExecutor;
use agentpipe_core::stage_executor::StageExecutor;
use agentpipe_core::state::FileStateStore;
use agentpipe_core::model::TokenUsage;
use agentpipe_core::{AbortHandle, PipelineRunner, RunOptions};
use async_trait::async_trait;
use uuid::Uuid;

fn stage(name: &str, agent_path: &std::path::Path, depends_on: &[&str]) -> StageConfig {
    StageConfig {
        name: name.to_string(),
        agent: agent_path.to_string_lossy().into_owned(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        enabled: true,
        condition: None,
        on_fail: None,
        timeout: 30,
        retry: RetryConfig {
            max_attempts: 1,
            backoff: 0,
        },
        inputs: Default::default(),
        runtime: None,
        auto_commit: None,
    }
}

fn write_agent(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(format!("{name}.md"));
    std::fs::write(&path, format!("you are the {name} agent")).unwrap();
    path
}

fn pipeline_config(name: &str, stages: Vec<StageConfig>) -> PipelineConfig {
    PipelineConfig {
        name: name.to_string(),
        trigger: TriggerSource {
            kind: "manual".to_string(),
            branches: Vec::new(),
        },
        stages,
        settings: Settings {
            execution_mode: ExecutionMode::Sequential,
            failure_strategy: FailureStrategy::Stop,
            ..Settings::default()
        },
        git: GitConfig::default(),
        pull_request: None,
        looping: Default::default(),
        context_reduction: Default::default(),
        notifications: Default::default(),
    }
}

fn runner(dir: &std::path::Path, runtime: Arc<dyn AgentRuntime>) -> PipelineRunner {
    let run_id = Uuid::new_v4();
    let handover = Arc::new(FileHandoverStore::new(dir.join("handover"), run_id));
    let state_store = Arc::new(FileStateStore::new(dir.join("runs")));
    let git = Arc::new(FakeGitOps::default());
    let stage_executor = Arc::new(StageExecutor::new(handover.clone(), git.clone()));
    let parallel_executor = Arc::new(ParallelExecutor::new(stage_executor));
    let context_reducer = Arc::new(ContextReducer::new(handover.clone()));
    let condition_evaluator = Arc::new(TemplateConditionEvaluator);
    let dispatcher = Arc::new(FanOutDispatcher::new(vec![]));

    let group_orchestrator = Arc::new(GroupOrchestrator::new(
        condition_evaluator,
        context_reducer,
        parallel_executor,
        state_store.clone(),
        dispatcher.clone(),
    ));

    PipelineRunner::new(
        git,
        None,
        handover,
        state_store,
        group_orchestrator,
        dispatcher,
        runtime,
    )
}

#[tokio::test]
async fn sequential_pipeline_runs_every_stage_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let lint = write_agent(dir.path(), "lint");
    let test = write_agent(dir.path(), "test");

    let config = pipeline_config(
        "demo",
        vec![stage("lint", &lint, &[]), stage("test", &test, &["lint"])],
    );

    let runtime = Arc::new(FakeAgentRuntime::succeeding("looks good"));
    let runner = runner(dir.path(), runtime);

    let state = runner
        .run_pipeline(config, RunOptions::default(), AbortHandle::new())
        .await;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.stages.len(), 2);
    assert!(state.stages.iter().all(|s| s.status.as_str() == "success"));
}

#[tokio::test]
async fn stop_strategy_halts_before_dependent_stage() {
    let dir = tempfile::tempdir().unwrap();
    let build = write_agent(dir.path(), "build");
    let deploy = write_agent(dir.path(), "deploy");

    let config = pipeline_config(
        "demo",
        vec![stage("build", &build, &[]), stage("deploy", &deploy, &["build"])],
    );

    let runtime = Arc::new(FakeAgentRuntime::failing("build broke"));
    let runner = runner(dir.path(), runtime);

    let state = runner
        .run_pipeline(config, RunOptions::default(), AbortHandle::new())
        .await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.stages.len(), 1, "deploy must never have been dispatched");
    assert_eq!(state.stages[0].stage_name, "build");
}

#[tokio::test]
async fn disabled_stage_is_skipped_and_pipeline_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let lint = write_agent(dir.path(), "lint");
    let mut skip_me = stage("skip-me", &lint, &[]);
    skip_me.enabled = false;

    let config = pipeline_config("demo", vec![skip_me]);
    let runtime = Arc::new(FakeAgentRuntime::succeeding("unused"));
    let runner = runner(dir.path(), runtime.clone());

    let state = runner
        .run_pipeline(config, RunOptions::default(), AbortHandle::new())
        .await;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.stages[0].status.as_str(), "skipped");
    assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn aborted_before_start_never_dispatches_a_stage() {
    let dir = tempfile::tempdir().unwrap();
    let lint = write_agent(dir.path(), "lint");
    let config = pipeline_config("demo", vec![stage("lint", &lint, &[])]);

    let runtime = Arc::new(FakeAgentRuntime::succeeding("unused"));
    let runner = runner(dir.path(), runtime.clone());

    let abort = AbortHandle::new();
    abort.abort();

    let state = runner.run_pipeline(config, RunOptions::default(), abort).await;

    assert_eq!(state.status, RunStatus::Aborted);
    assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn warn_strategy_marks_partial_and_continues_to_independent_stage() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = write_agent(dir.path(), "flaky");
    let unrelated = write_agent(dir.path(), "unrelated");

    let mut flaky_stage = stage("flaky", &flaky, &[]);
    flaky_stage.on_fail = Some(FailureStrategy::Warn);
    let unrelated_stage = stage("unrelated", &unrelated, &[]);

    let config = pipeline_config("demo", vec![flaky_stage, unrelated_stage]);

    // Two independent stages run as one sequential group in declaration
    // order. The first fails with `warn`, which must not stop the second.
    struct AlternatingRuntime {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentRuntime for AlternatingRuntime {
        async fn execute(
            &self,
            _request: AgentRequest,
            _on_output: Option<OutputSink>,
            _abort: &AbortHandle,
        ) -> agentpipe_core::Result<AgentResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(agentpipe_core::Error::Other("flaky failed".to_string()))
            } else {
                Ok(AgentResponse {
                    text_output: "ok".to_string(),
                    extracted_data: None,
                    token_usage: TokenUsage::default(),
                    num_turns: 1,
                })
            }
        }

        fn capabilities(&self) -> agentpipe_core::agent_runtime::RuntimeCapabilities {
            Default::default()
        }

        fn validate(&self) -> agentpipe_core::agent_runtime::RuntimeValidation {
            Default::default()
        }
    }

    let runtime = Arc::new(AlternatingRuntime {
        calls: AtomicUsize::new(0),
    });
    let runner = runner(dir.path(), runtime.clone());

    let state = runner
        .run_pipeline(config, RunOptions::default(), AbortHandle::new())
        .await;

    assert_eq!(state.status, RunStatus::Partial);
    assert_eq!(state.stages.len(), 2);
    assert_eq!(runtime.calls.load(Ordering::SeqCst), 2, "both independent stages must run");
}

#[tokio::test]
async fn invalid_dependency_fails_before_any_agent_call() {
    let dir = tempfile::tempdir().unwrap();
    let lint = write_agent(dir.path(), "lint");
    let broken = stage("lint", &lint, &["does-not-exist"]);

    let config = pipeline_config("demo", vec![broken]);
    let runtime = Arc::new(FakeAgentRuntime::succeeding("unused"));
    let runner = runner(dir.path(), runtime.clone());

    let state = runner
        .run_pipeline(config, RunOptions::default(), AbortHandle::new())
        .await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
}
