//! `NotificationDispatcher`: fans out pipeline lifecycle events to external
//! sinks (Slack, generic webhooks). Failures are always warned, never fatal
//! (`NotificationError` per the error design is non-propagating).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::RunState;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid channel configuration: {0}")]
    InvalidConfiguration(String),

    #[error("rate limit exceeded for channel: {0}")]
    RateLimitExceeded(String),

    #[error("failed to send notification: {0}")]
    SendError(String),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    PipelineStarted,
    StageCompleted,
    StageFailed,
    PipelineCompleted,
    PipelineFailed,
    PrCreated,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::PipelineStarted => "pipeline.started",
            LifecycleEvent::StageCompleted => "stage.completed",
            LifecycleEvent::StageFailed => "stage.failed",
            LifecycleEvent::PipelineCompleted => "pipeline.completed",
            LifecycleEvent::PipelineFailed => "pipeline.failed",
            LifecycleEvent::PrCreated => "pr.created",
        }
    }
}

/// An event carries the current (already cloned) state plus event-specific fields.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub event: LifecycleEvent,
    pub state: RunState,
    pub stage_name: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Slack,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    Slack { webhook_url: String },
    Webhook { url: String },
}

impl ChannelConfig {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            ChannelConfig::Slack { .. } => ChannelType::Slack,
            ChannelConfig::Webhook { .. } => ChannelType::Webhook,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ChannelConfig::Slack { webhook_url } => {
                if !webhook_url.starts_with("https://hooks.slack.com/") {
                    return Err(NotificationError::InvalidConfiguration(
                        "invalid Slack webhook URL format".to_string(),
                    ));
                }
            }
            ChannelConfig::Webhook { url } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(NotificationError::InvalidConfiguration(
                        "webhook url must be http(s)".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Sliding-window rate limiter: at most `max_per_window` sends per channel key
/// within `window`.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    history: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut history = self.history.lock().unwrap();
        let entries = history.entry(key.to_string()).or_default();
        entries.retain(|t| now.signed_duration_since(*t) < self.window);
        if entries.len() >= self.max_per_window {
            return false;
        }
        entries.push(now);
        true
    }
}

/// A single delivery sink. Concrete HTTP delivery is out of scope for the
/// engine itself — tests and the CLI supply implementations (or fakes).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn channel_type(&self) -> ChannelType;
    async fn send(&self, event: &NotificationEvent) -> Result<()>;
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, event: NotificationEvent);
}

pub struct FanOutDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
    limiter: RateLimiter,
}

impl FanOutDispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self {
            sinks,
            limiter: RateLimiter::new(30, Duration::minutes(1)),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for FanOutDispatcher {
    async fn dispatch(&self, event: NotificationEvent) {
        for sink in &self.sinks {
            let key = format!("{:?}:{}", sink.channel_type(), event.event.as_str());
            if !self.limiter.check_and_record(&key) {
                warn!(channel = ?sink.channel_type(), event = event.event.as_str(), "rate limited, dropping notification");
                continue;
            }
            if let Err(e) = sink.send(&event).await {
                warn!(channel = ?sink.channel_type(), error = %e, "notification delivery failed");
            }
        }
    }
}

/// Delivery sink that just logs the event. Useful as the default when no
/// `notifications` config is set, and as a building block when composing a
/// `FanOutDispatcher` alongside real channels.
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        tracing::info!(
            event = event.event.as_str(),
            stage = ?event.stage_name,
            "pipeline notification"
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub received: StdMutex<Vec<LifecycleEvent>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn channel_type(&self) -> ChannelType {
            ChannelType::Webhook
        }

        async fn send(&self, event: &NotificationEvent) -> Result<()> {
            self.received.lock().unwrap().push(event.event);
            Ok(())
        }
    }
}
