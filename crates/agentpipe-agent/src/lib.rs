//! agentpipe-agent — a concrete `AgentRuntime` backed by the Claude Messages API.

pub mod client;

pub use client::{ClaudeAgentRuntime, ClaudeClient, ClaudeClientConfig};
