use std::collections::VecDeque;

use crate::error::Result;
use crate::signaling::{SignalingChannel, Signal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: String,
    pub content: String,
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            content: content.into(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// Chat history for one session, newest message first.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push_front(message);
    }

    /// Append locally, then transmit. A failed transmission leaves the local copy in place.
    pub fn send(
        &mut self,
        channel: &SignalingChannel,
        content: &str,
        identity: &str,
    ) -> Result<ChatMessage> {
        let message = ChatMessage::new(identity, content);
        self.append(message.clone());
        let envelope = Signal::chat(content).encode()?;
        channel.send(&envelope)?;
        Ok(message)
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn latest(&self) -> Option<&ChatMessage> {
        self.messages.front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
