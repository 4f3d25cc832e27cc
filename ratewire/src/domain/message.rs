//! Outbound message entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::priority::MessagePriority;

/// Default number of delivery attempts before a message is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A message waiting for delivery on one channel.
///
/// Everything but `attempt_count` is fixed once the message is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Unique message id.
    pub id: Uuid,
    /// Opaque destination identifier (e.g. a chat id).
    pub target: String,
    /// Opaque content.
    pub body: String,
    /// Priority class.
    pub priority: MessagePriority,
    /// When the message was created.
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempts made so far.
    pub attempt_count: u32,
    /// Attempt cap for this message. `None` uses the channel default.
    pub max_attempts: Option<u32>,
}

impl OutboundMessage {
    /// Create a `Normal` priority message.
    pub fn new(target: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            body: body.into(),
            priority: MessagePriority::default(),
            enqueued_at: Utc::now(),
            attempt_count: 0,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Attempt cap, falling back to `channel_default`.
    pub fn attempt_limit(&self, channel_default: u32) -> u32 {
        self.max_attempts.unwrap_or(channel_default)
    }

    /// Whether another attempt is allowed.
    pub fn has_attempts_left(&self, channel_default: u32) -> bool {
        self.attempt_count < self.attempt_limit(channel_default)
    }

    /// Short preview of the body for log lines.
    pub fn preview(&self) -> &str {
        const PREVIEW_CHARS: usize = 50;
        match self.body.char_indices().nth(PREVIEW_CHARS) {
            Some((idx, _)) => &self.body[..idx],
            None => &self.body,
        }
    }
}

impl std::fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OutboundMessage(target={}, priority={}, body={})",
            self.target,
            self.priority,
            self.preview()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_defaults() {
        let msg = OutboundMessage::new("123", "Test");
        assert_eq!(msg.priority, MessagePriority::Normal);
        assert_eq!(msg.attempt_count, 0);
        assert_eq!(msg.attempt_limit(DEFAULT_MAX_ATTEMPTS), 3);
    }

    #[test]
    fn test_message_override_attempts() {
        let mut msg = OutboundMessage::new("123", "Test").with_max_attempts(1);
        assert!(msg.has_attempts_left(5));
        msg.attempt_count = 1;
        assert!(!msg.has_attempts_left(5));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let body = "é".repeat(80);
        let msg = OutboundMessage::new("1", body);
        assert_eq!(msg.preview().chars().count(), 50);

        let short = OutboundMessage::new("1", "hi");
        assert_eq!(short.preview(), "hi");
    }

    #[test]
    fn test_display_contains_target_and_priority() {
        let msg = OutboundMessage::new("123", "Test message").with_priority(MessagePriority::High);
        let shown = msg.to_string();
        assert!(shown.contains("123"));
        assert!(shown.contains("HIGH"));
    }
}
