//! `AgentRuntime`: the opaque LLM invocation capability `StageExecutor` drives.
//!
//! The engine only depends on this trait; concrete runtimes (HTTP-backed,
//! in-process fakes for tests) live in satellite crates or `#[cfg(test)]` modules.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::model::{PermissionMode, TokenUsage};
use crate::Result;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub text_output: String,
    pub extracted_data: Option<serde_json::Value>,
    pub token_usage: TokenUsage,
    pub num_turns: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeCapabilities {
    pub supports_streaming: bool,
    pub supports_token_tracking: bool,
    pub available_models: Vec<String>,
    pub permission_modes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// A sink for incremental agent output. Producer-writes-only: no shared buffers,
/// `onOutput` is advisory (used for UI) and delivery is best-effort.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn execute(
        &self,
        request: AgentRequest,
        on_output: Option<OutputSink>,
        abort: &crate::runner::AbortHandle,
    ) -> Result<AgentResponse>;

    fn capabilities(&self) -> RuntimeCapabilities;

    fn validate(&self) -> RuntimeValidation;
}

/// Process-wide registry of named runtimes, mirroring the source system's
/// singleton `AgentRuntimeRegistry` but exposed as an injectable value — the
/// runner takes an `Arc<dyn AgentRuntime>` directly and only falls back to this
/// registry when a stage names a `runtime` override by string.
static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn AgentRuntime>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register(name: impl Into<String>, runtime: Arc<dyn AgentRuntime>) {
    REGISTRY.write().unwrap().insert(name.into(), runtime);
}

pub fn get_runtime(name: &str) -> Option<Arc<dyn AgentRuntime>> {
    REGISTRY.read().unwrap().get(name).cloned()
}

pub fn clear_registry() {
    REGISTRY.write().unwrap().clear();
}

#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed-response fake for `StageExecutor`/`ParallelExecutor` tests.
    pub struct FakeAgentRuntime {
        pub response: Result<AgentResponse>,
        pub calls: AtomicUsize,
    }

    impl FakeAgentRuntime {
        pub fn succeeding(text: impl Into<String>) -> Self {
            Self {
                response: Ok(AgentResponse {
                    text_output: text.into(),
                    extracted_data: None,
                    token_usage: TokenUsage::default(),
                    num_turns: 1,
                }),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(message: impl Into<String>) -> Self {
            Self {
                response: Err(crate::Error::Other(message.into())),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentRuntime for FakeAgentRuntime {
        async fn execute(
            &self,
            _request: AgentRequest,
            _on_output: Option<OutputSink>,
            _abort: &crate::runner::AbortHandle,
        ) -> Result<AgentResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(resp) => Ok(resp.clone()),
                Err(e) => Err(crate::Error::Other(e.to_string())),
            }
        }

        fn capabilities(&self) -> RuntimeCapabilities {
            RuntimeCapabilities::default()
        }

        fn validate(&self) -> RuntimeValidation {
            RuntimeValidation {
                valid: true,
                ..Default::default()
            }
        }
    }
}
