use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for one message, as assigned by the message service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for MessageId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the live message list.
///
/// `attempts` is absent until the message has been regenerated at least once, and
/// then always holds two or more snapshots with the original response first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_attempt_index: Option<usize>,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            attempts: None,
            current_attempt_index: None,
        }
    }

    pub fn user(id: impl Into<MessageId>, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content)
    }

    pub fn assistant(id: impl Into<MessageId>, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, content)
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Number of captured versions, counting a never-regenerated message as one.
    pub fn attempt_count(&self) -> usize {
        self.attempts.as_ref().map_or(1, Vec::len)
    }

    /// The version that should be rendered: the selected attempt when attempts exist.
    pub fn displayed(&self) -> &Message {
        self.attempts
            .as_ref()
            .and_then(|attempts| attempts.get(self.current_attempt_index.unwrap_or(0)))
            .unwrap_or(self)
    }

    pub fn displayed_content(&self) -> &str {
        &self.displayed().content
    }
}
