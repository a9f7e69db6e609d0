//! External collaborators the engine calls out to
//!
//! The engine never sends messages or resolves segments itself. Each
//! concern sits behind a trait so deployments plug in their transport and
//! tests plug in doubles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dripline_core::Subscriber;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// A message handed to the sender by a `send_message` step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub automation_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
}

/// Receipt returned by a sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
}

/// Failure reported by a sender. Surfaces as a failed step.
#[derive(Debug, Clone, thiserror::Error)]
#[error("message send failed: {0}")]
pub struct SendError(pub String);

/// Message transport
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    async fn send(
        &self,
        subscriber: &Subscriber,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, SendError>;
}

/// Sender that only logs. Used when no transport is configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingMessageSender;

#[async_trait]
impl MessageSender for LoggingMessageSender {
    async fn send(
        &self,
        subscriber: &Subscriber,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, SendError> {
        let message_id = format!("msg-{}", Uuid::now_v7());
        debug!(
            %message_id,
            recipient = %subscriber.email,
            subject = message.subject.as_deref().unwrap_or("from template"),
            template_id = message.template_id.as_deref(),
            "sending message"
        );
        Ok(SentMessage {
            message_id,
            sent_at: Utc::now(),
        })
    }
}

/// Resolves segment membership for trigger targeting
#[async_trait]
pub trait SegmentResolver: Send + Sync + 'static {
    async fn is_member(&self, subscriber: &Subscriber, segment_id: &str) -> bool;
}

/// Membership read from the subscriber's own segment list
#[derive(Debug, Default, Clone)]
pub struct SubscriberSegments;

#[async_trait]
impl SegmentResolver for SubscriberSegments {
    async fn is_member(&self, subscriber: &Subscriber, segment_id: &str) -> bool {
        subscriber.in_segment(segment_id)
    }
}

/// Source of the split draw
pub trait RandomSource: Send + Sync + 'static {
    /// Uniform value in `[0, 100)`
    fn percent(&self) -> f64;
}

/// Thread-local RNG
#[derive(Debug, Default, Clone)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn percent(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..100.0)
    }
}
