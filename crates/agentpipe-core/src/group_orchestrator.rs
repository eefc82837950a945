//! `GroupOrchestrator`: executes one execution-graph level (group) of stages —
//! resolving per-stage disposition (disabled/condition-skipped/runnable),
//! dispatching runnable stages in parallel or sequentially, applying the
//! failure policy, triggering context reduction, and publishing the resulting
//! state to its observers.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::agent_runtime::{AgentRuntime, OutputSink};
use crate::condition::ConditionEvaluator;
use crate::context_reducer::ContextReducer;
use crate::model::{
    ExecutionGroup, ExecutionMode, FailureStrategy, RunState, RunStatus, StageConfig, StageExecution,
    StageStatus,
};
use crate::notifications::{LifecycleEvent, NotificationDispatcher, NotificationEvent};
use crate::parallel_executor::{aggregate_results, ParallelExecutor};
use crate::runner::AbortHandle;
use crate::state::StateStore;

/// Advisory sink called with a cloned snapshot of `RunState` after each group.
pub type StateChangeSink = Arc<dyn Fn(&RunState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageDisposition {
    Disabled,
    ConditionFalse,
    Runnable,
}

pub struct GroupOutcome {
    pub should_stop: bool,
}

pub struct GroupOrchestrator {
    condition_evaluator: Arc<dyn ConditionEvaluator>,
    context_reducer: Arc<ContextReducer>,
    parallel_executor: Arc<ParallelExecutor>,
    state_store: Arc<dyn StateStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl GroupOrchestrator {
    pub fn new(
        condition_evaluator: Arc<dyn ConditionEvaluator>,
        context_reducer: Arc<ContextReducer>,
        parallel_executor: Arc<ParallelExecutor>,
        state_store: Arc<dyn StateStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            condition_evaluator,
            context_reducer,
            parallel_executor,
            state_store,
            dispatcher,
        }
    }

    pub async fn execute_group(
        &self,
        group: &ExecutionGroup,
        state: &mut RunState,
        execution_mode: ExecutionMode,
        pipeline_failure_strategy: FailureStrategy,
        runtime: Arc<dyn AgentRuntime>,
        on_output: Option<OutputSink>,
        on_state_change: Option<StateChangeSink>,
        abort: &AbortHandle,
    ) -> GroupOutcome {
        if self.maybe_reduce_context(state, &runtime, abort).await {
            self.publish(state, on_state_change.as_ref()).await;
        }

        let mut runnable = Vec::new();
        let mut settled = Vec::new();
        for stage in &group.stages {
            match self.disposition(stage, state) {
                StageDisposition::Disabled => settled.push(StageExecution::skipped(stage.name.clone())),
                StageDisposition::ConditionFalse => {
                    settled.push(StageExecution::skipped_condition(stage.name.clone(), false))
                }
                StageDisposition::Runnable => runnable.push(stage.clone()),
            }
        }

        let ran = if !runnable.is_empty() {
            match execution_mode {
                ExecutionMode::Parallel => {
                    self.parallel_executor
                        .execute_parallel_group(&runnable, state, runtime.clone(), on_output.clone(), abort)
                        .await
                }
                ExecutionMode::Sequential => {
                    self.parallel_executor
                        .execute_sequential_group(
                            &runnable,
                            state,
                            runtime.clone(),
                            on_output.clone(),
                            abort,
                            pipeline_failure_strategy,
                        )
                        .await
                }
            }
        } else {
            Vec::new()
        };

        let runnable_names: Vec<&str> = runnable.iter().map(|s| s.name.as_str()).collect();
        settled.extend(ran);
        settled.sort_by_key(|e| {
            group
                .stages
                .iter()
                .position(|s| s.name == e.stage_name)
                .unwrap_or(usize::MAX)
        });
        let _ = runnable_names;

        let summary = aggregate_results(&settled);
        let mut should_stop = false;

        for execution in &settled {
            if execution.status != StageStatus::Failed {
                continue;
            }
            let stage = group
                .stages
                .iter()
                .find(|s| s.name == execution.stage_name);
            let strategy = stage
                .map(|s| s.effective_failure_strategy(pipeline_failure_strategy))
                .unwrap_or(pipeline_failure_strategy);

            self.dispatcher
                .dispatch(NotificationEvent {
                    event: LifecycleEvent::StageFailed,
                    state: state.clone(),
                    stage_name: Some(execution.stage_name.clone()),
                    detail: execution.error.as_ref().map(|e| e.message.clone()),
                })
                .await;

            match strategy {
                FailureStrategy::Stop => should_stop = true,
                FailureStrategy::Warn | FailureStrategy::Continue => {
                    if state.status != RunStatus::Failed {
                        state.status = RunStatus::Partial;
                    }
                    warn!(
                        stage = %execution.stage_name,
                        strategy = strategy.as_str(),
                        "stage failed but pipeline continues"
                    );
                }
            }
        }

        for execution in settled {
            self.dispatcher
                .dispatch(NotificationEvent {
                    event: LifecycleEvent::StageCompleted,
                    state: state.clone(),
                    stage_name: Some(execution.stage_name.clone()),
                    detail: None,
                })
                .await;
            state.stages.push(execution);
        }

        info!(
            level = group.level,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "group completed"
        );

        self.publish(state, on_state_change.as_ref()).await;
        GroupOutcome { should_stop }
    }

    fn disposition(&self, stage: &StageConfig, state: &RunState) -> StageDisposition {
        if !stage.enabled {
            return StageDisposition::Disabled;
        }
        if let Some(condition) = &stage.condition {
            match self.condition_evaluator.evaluate(condition, state) {
                Ok(result) if result.as_bool() => StageDisposition::Runnable,
                Ok(_) => StageDisposition::ConditionFalse,
                Err(e) => {
                    warn!(stage = %stage.name, error = %e, "condition evaluation failed, skipping stage (fail-safe)");
                    StageDisposition::ConditionFalse
                }
            }
        } else {
            StageDisposition::Runnable
        }
    }

    /// Runs the reducer agent when accumulated context crosses the configured
    /// threshold, splicing its sentinel execution into `state.stages`.
    async fn maybe_reduce_context(
        &self,
        state: &mut RunState,
        runtime: &Arc<dyn AgentRuntime>,
        abort: &AbortHandle,
    ) -> bool {
        let config = &state.pipeline_config.context_reduction;
        if !config.enabled {
            return false;
        }
        let accumulated = match self.context_reducer.estimate_accumulated_tokens(state).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to estimate accumulated context tokens");
                return false;
            }
        };
        if !self.context_reducer.should_reduce(config, accumulated) {
            return false;
        }
        info!(accumulated, max_tokens = config.max_tokens, "triggering context reduction");
        let execution = self
            .context_reducer
            .run_reduction(config, runtime.as_ref(), abort)
            .await;
        state.stages.push(execution);
        true
    }

    async fn publish(&self, state: &RunState, on_state_change: Option<&StateChangeSink>) {
        state_stamp_duration(state);
        if let Err(e) = self.state_store.save(state).await {
            warn!(error = %e, "failed to persist run state after group");
        }
        if let Some(sink) = on_state_change {
            sink(state);
        }
    }
}

fn state_stamp_duration(state: &mut RunState) {
    let elapsed: f64 = state.stages.iter().filter_map(|s| s.duration).sum();
    state.artifacts.total_duration = elapsed;
    let _ = Utc::now();
}
