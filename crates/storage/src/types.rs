use std::fmt;

use super::error::{InvariantViolationSnafu, StorageResult};
use super::ids::{MessageId, StreamId, ThreadId, UserId};

/// Lifecycle status of one generation stream.
///
/// `streaming → paused → resumed → (streaming | completed)`, plus
/// `streaming → completed` and any non-terminal state `→ cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    Streaming,
    Paused,
    Resumed,
    Completed,
    Cancelled,
}

impl StreamStatus {
    pub const ALL: [StreamStatus; 5] = [
        Self::Streaming,
        Self::Paused,
        Self::Resumed,
        Self::Completed,
        Self::Cancelled,
    ];

    pub const NON_TERMINAL: [StreamStatus; 3] = [Self::Streaming, Self::Paused, Self::Resumed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        match raw {
            "streaming" => Ok(Self::Streaming),
            "paused" => Ok(Self::Paused),
            "resumed" => Ok(Self::Resumed),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => InvariantViolationSnafu {
                stage: "stream-status-parse",
                details: format!("unknown stream status '{raw}'"),
            }
            .fail(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns true when `self → next` is an edge of the stream state machine.
    pub fn can_transition_to(&self, next: StreamStatus) -> bool {
        match (self, next) {
            (Self::Completed | Self::Cancelled, _) => false,
            (_, Self::Cancelled) => true,
            (Self::Streaming, Self::Paused | Self::Completed) => true,
            (Self::Paused, Self::Resumed) => true,
            (Self::Resumed, Self::Streaming | Self::Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: StreamId,
    pub thread_id: ThreadId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub status: StreamStatus,
    pub started_at_unix_millis: i64,
    pub last_updated_at_unix_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStream {
    pub thread_id: ThreadId,
    pub message_id: MessageId,
    pub user_id: UserId,
}

/// Conditional status change: applies only while the record is in one of `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: Vec<StreamStatus>,
    pub to: StreamStatus,
}

impl StatusTransition {
    pub fn new(from: impl Into<Vec<StreamStatus>>, to: StreamStatus) -> Self {
        Self {
            from: from.into(),
            to,
        }
    }

    pub fn single(from: StreamStatus, to: StreamStatus) -> Self {
        Self::new(vec![from], to)
    }
}
