use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat turn, serialized in the Chat Completions message shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation sent to the reply generator: the system prompt pinned at
/// index 0, then the most recent turns. `cap` counts the system prompt.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    system: ChatMessage,
    turns: VecDeque<ChatMessage>,
    cap: usize,
}

impl ConversationHistory {
    pub fn new(system_prompt: impl Into<String>, cap: usize) -> Self {
        let cap = cap.max(2);
        Self {
            system: ChatMessage::system(system_prompt),
            turns: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.turns.push_back(message);
        while self.turns.len() + 1 > self.cap {
            self.turns.pop_front();
        }
    }

    /// Snapshot in send order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        std::iter::once(self.system.clone())
            .chain(self.turns.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.turns.back()
    }
}
