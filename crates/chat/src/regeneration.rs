use snafu::Snafu;

use crate::message::{Message, MessageId};

pub type RegenerationResult<T> = Result<T, RegenerationError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegenerationError {
    #[snafu(display(
        "regeneration of {active} is still in progress, refusing to start {requested}"
    ))]
    RegenerationInProgress {
        stage: &'static str,
        active: MessageId,
        requested: MessageId,
    },
    #[snafu(display("message {message_id} is not in the conversation"))]
    UnknownMessage {
        stage: &'static str,
        message_id: MessageId,
    },
}

/// What happens when a regeneration starts while another one is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPolicy {
    /// The new target replaces the old one, which is dropped without a capture.
    #[default]
    LastWriterWins,
    /// The new start fails with [`RegenerationError::RegenerationInProgress`].
    RejectWhileActive,
}

/// Single-flight regeneration state. The target id and its snapshot always move together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegenerationState {
    #[default]
    Idle,
    Regenerating {
        message_id: MessageId,
        original: Box<Message>,
    },
}

impl RegenerationState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn regenerating_message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Regenerating { message_id, .. } => Some(message_id),
            Self::Idle => None,
        }
    }

    pub fn original_message(&self) -> Option<&Message> {
        match self {
            Self::Regenerating { original, .. } => Some(original),
            Self::Idle => None,
        }
    }
}

/// Receives every merged message produced by a successful capture.
pub trait AttemptSink {
    fn attempt_captured(&mut self, merged: &Message);
}

impl<F> AttemptSink for F
where
    F: FnMut(&Message),
{
    fn attempt_captured(&mut self, merged: &Message) {
        self(merged)
    }
}

/// Tracks the one message being regenerated and folds its new response into the
/// message's attempts.
#[derive(Debug)]
pub struct RegenerationCoordinator<S> {
    state: RegenerationState,
    policy: StartPolicy,
    sink: S,
}

impl<S: AttemptSink> RegenerationCoordinator<S> {
    pub fn new(sink: S) -> Self {
        Self::with_policy(sink, StartPolicy::default())
    }

    pub fn with_policy(sink: S, policy: StartPolicy) -> Self {
        Self {
            state: RegenerationState::Idle,
            policy,
            sink,
        }
    }

    pub fn state(&self) -> &RegenerationState {
        &self.state
    }

    pub fn is_regenerating(&self) -> bool {
        !self.state.is_idle()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// `idle → regenerating`, snapshotting `message` as the original response.
    pub fn start_regeneration(
        &mut self,
        message_id: MessageId,
        message: &Message,
    ) -> RegenerationResult<()> {
        if let RegenerationState::Regenerating {
            message_id: active, ..
        } = &self.state
        {
            match self.policy {
                StartPolicy::RejectWhileActive => {
                    return RegenerationInProgressSnafu {
                        stage: "start-regeneration",
                        active: active.clone(),
                        requested: message_id,
                    }
                    .fail();
                }
                StartPolicy::LastWriterWins => {
                    tracing::debug!(
                        superseded = %active,
                        message_id = %message_id,
                        "regeneration superseded before capture"
                    );
                }
            }
        }

        tracing::debug!(message_id = %message_id, "regeneration started");
        self.state = RegenerationState::Regenerating {
            message_id,
            original: Box::new(message.clone()),
        };
        Ok(())
    }

    /// `regenerating → idle`. Safe to call in any state.
    pub fn finish_regeneration(&mut self) {
        if let RegenerationState::Regenerating { message_id, .. } = &self.state {
            tracing::debug!(message_id = %message_id, "regeneration finished");
        }
        self.state = RegenerationState::Idle;
    }

    /// Merges `new_message` into the original's attempts, hands the result to the
    /// sink and returns to idle. Returns `None` without side effects while idle, which
    /// happens when a stale event arrives after the regeneration already resolved.
    pub fn capture_new_attempt(&mut self, new_message: Message) -> Option<Message> {
        let Some(original) = self.state.original_message() else {
            tracing::debug!(message_id = %new_message.id, "ignoring capture while idle");
            return None;
        };

        let merged = merge_attempt(original, new_message);
        self.sink.attempt_captured(&merged);
        self.finish_regeneration();
        Some(merged)
    }
}

/// Appends `new_message` to the original's attempts, creating `[original, new]` on
/// the first regeneration. The cursor points at the new attempt.
pub fn merge_attempt(original: &Message, new_message: Message) -> Message {
    let mut merged = original.clone();
    let attempts = match merged.attempts.take() {
        Some(mut attempts) => {
            attempts.push(new_message);
            attempts
        }
        None => vec![original.clone(), new_message],
    };

    merged.current_attempt_index = Some(attempts.len() - 1);
    merged.attempts = Some(attempts);
    merged
}
