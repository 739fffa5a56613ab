use crate::message::{Message, MessageId};
use crate::regeneration::{AttemptSink, RegenerationCoordinator, RegenerationState};

/// Discrete change to the live message list, emitted by the message pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageListEvent {
    Appended(Message),
    ContentChanged {
        message_id: MessageId,
        content: String,
    },
    Removed(MessageId),
    /// The whole list was replaced, e.g. after a reload.
    Reset(Vec<Message>),
}

impl MessageListEvent {
    /// Applies the event to `messages`. Returns false when the targeted message is missing.
    pub fn apply_to(&self, messages: &mut Vec<Message>) -> bool {
        match self {
            Self::Appended(message) => {
                messages.push(message.clone());
                true
            }
            Self::ContentChanged {
                message_id,
                content,
            } => match messages.iter_mut().find(|message| &message.id == message_id) {
                Some(message) => {
                    message.content.clone_from(content);
                    true
                }
                None => false,
            },
            Self::Removed(message_id) => {
                let before = messages.len();
                messages.retain(|message| &message.id != message_id);
                messages.len() != before
            }
            Self::Reset(replacement) => {
                messages.clone_from(replacement);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePath {
    /// A new assistant message was appended next to the regenerated one.
    Append,
    /// The regenerated message was rewritten in place.
    Mutation,
}

/// A regenerated response that was folded into attempts and spliced back into the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub path: CapturePath,
    pub index: usize,
    /// Id the new response streams under: the appended message or the regenerated one.
    pub source: MessageId,
    pub message: Message,
}

#[derive(Debug, Clone)]
struct Detection {
    path: CapturePath,
    index: usize,
    candidate: Message,
}

/// Content for a captured attempt that is still streaming in under `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LiveTail {
    source: MessageId,
    host: MessageId,
}

/// Watches list changes while a regeneration is in progress and captures the new
/// response when it shows up.
///
/// Baselines (list length and the regenerated message's content) are refreshed after
/// every observation whether or not anything was captured.
#[derive(Debug, Default)]
pub struct MessageInterceptor {
    observed_len: usize,
    observed_content: Option<String>,
    pending_append: Option<MessageId>,
    tail: Option<LiveTail>,
}

impl MessageInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets baselines to the list as it is when regeneration of `regenerating` starts.
    pub fn begin(&mut self, messages: &[Message], regenerating: &MessageId) {
        self.observed_len = messages.len();
        self.observed_content =
            find(messages, regenerating).map(|index| messages[index].content.clone());
        self.pending_append = None;
        self.tail = None;
    }

    /// Evaluates one event that has already been applied to `messages`.
    pub fn observe<S: AttemptSink>(
        &mut self,
        event: &MessageListEvent,
        messages: &mut Vec<Message>,
        coordinator: &mut RegenerationCoordinator<S>,
    ) -> Option<Capture> {
        let detection = match coordinator.state() {
            RegenerationState::Regenerating {
                message_id,
                original,
            } => match event {
                MessageListEvent::Appended(appended) => {
                    self.detect_append(appended, messages, message_id)
                }
                MessageListEvent::ContentChanged {
                    message_id: changed,
                    content,
                } => self.detect_content_change(changed, content, messages, message_id, original),
                MessageListEvent::Removed(removed) => {
                    if self.pending_append.as_ref() == Some(removed) {
                        self.pending_append = None;
                    }
                    None
                }
                MessageListEvent::Reset(_) => self.detect_snapshot(messages, message_id, original),
            },
            RegenerationState::Idle => None,
        };

        self.finish_observation(detection, messages, coordinator)
    }

    /// Same decisions as [`MessageInterceptor::observe`] for pipelines that only expose
    /// whole-list snapshots. `messages` is the current list.
    pub fn observe_snapshot<S: AttemptSink>(
        &mut self,
        messages: &mut Vec<Message>,
        coordinator: &mut RegenerationCoordinator<S>,
    ) -> Option<Capture> {
        let detection = match coordinator.state() {
            RegenerationState::Regenerating {
                message_id,
                original,
            } => self.detect_snapshot(messages, message_id, original),
            RegenerationState::Idle => None,
        };

        self.finish_observation(detection, messages, coordinator)
    }

    /// Routes streamed content for a captured attempt into the newest attempt of its
    /// host message. Returns the updated host, or `None` when `message_id` is not
    /// being followed.
    pub fn follow_tail(
        &self,
        message_id: &MessageId,
        content: &str,
        messages: &mut [Message],
    ) -> Option<Message> {
        let tail = self.tail.as_ref().filter(|tail| &tail.source == message_id)?;
        let host = messages.iter_mut().find(|message| message.id == tail.host)?;
        let attempt = host.attempts.as_mut()?.last_mut()?;
        attempt.content = content.to_string();
        Some(host.clone())
    }

    pub fn is_following(&self, message_id: &MessageId) -> bool {
        self.tail
            .as_ref()
            .is_some_and(|tail| &tail.source == message_id || &tail.host == message_id)
    }

    /// Stops following `message_id`, typically once its stream has finished.
    pub fn release(&mut self, message_id: &MessageId) {
        if self.is_following(message_id) {
            self.tail = None;
        }
        if self.pending_append.as_ref() == Some(message_id) {
            self.pending_append = None;
        }
    }

    pub fn reset(&mut self, messages: &[Message]) {
        self.observed_len = messages.len();
        self.observed_content = None;
        self.pending_append = None;
        self.tail = None;
    }

    fn detect_append(
        &mut self,
        appended: &Message,
        messages: &[Message],
        regenerating: &MessageId,
    ) -> Option<Detection> {
        if messages.len() != self.observed_len + 1
            || !appended.is_assistant()
            || &appended.id == regenerating
        {
            return None;
        }

        let index = messages
            .iter()
            .rposition(|message| message.id == appended.id)?;
        self.append_candidate(&messages[index], index)
    }

    fn detect_content_change(
        &mut self,
        changed: &MessageId,
        content: &str,
        messages: &[Message],
        regenerating: &MessageId,
        original: &Message,
    ) -> Option<Detection> {
        if messages.len() != self.observed_len || content.trim().is_empty() {
            return None;
        }
        let index = find(messages, changed)?;

        if self.pending_append.as_ref() == Some(changed) {
            self.pending_append = None;
            return Some(Detection {
                path: CapturePath::Append,
                index,
                candidate: as_attempt(&messages[index]),
            });
        }

        if changed != regenerating
            || content == original.content
            || self.observed_content.as_deref() == Some(content)
        {
            return None;
        }

        Some(Detection {
            path: CapturePath::Mutation,
            index,
            candidate: as_attempt(&messages[index]),
        })
    }

    fn detect_snapshot(
        &mut self,
        messages: &[Message],
        regenerating: &MessageId,
        original: &Message,
    ) -> Option<Detection> {
        if messages.len() == self.observed_len + 1 {
            let index = messages.len() - 1;
            let newest = &messages[index];
            if newest.is_assistant() && &newest.id != regenerating {
                return self.append_candidate(newest, index);
            }
            return None;
        }
        if messages.len() != self.observed_len {
            return None;
        }

        if let Some(pending) = self.pending_append.clone()
            && let Some(index) = find(messages, &pending)
            && !messages[index].content.trim().is_empty()
        {
            self.pending_append = None;
            return Some(Detection {
                path: CapturePath::Append,
                index,
                candidate: as_attempt(&messages[index]),
            });
        }

        let index = find(messages, regenerating)?;
        let content = messages[index].content.as_str();
        if content.trim().is_empty()
            || content == original.content
            || self.observed_content.as_deref() == Some(content)
        {
            return None;
        }

        Some(Detection {
            path: CapturePath::Mutation,
            index,
            candidate: as_attempt(&messages[index]),
        })
    }

    /// Empty assistant placeholders are remembered and captured on their first content.
    fn append_candidate(&mut self, appended: &Message, index: usize) -> Option<Detection> {
        if appended.content.trim().is_empty() {
            tracing::debug!(message_id = %appended.id, "waiting for content of appended response");
            self.pending_append = Some(appended.id.clone());
            return None;
        }

        Some(Detection {
            path: CapturePath::Append,
            index,
            candidate: as_attempt(appended),
        })
    }

    fn finish_observation<S: AttemptSink>(
        &mut self,
        detection: Option<Detection>,
        messages: &mut Vec<Message>,
        coordinator: &mut RegenerationCoordinator<S>,
    ) -> Option<Capture> {
        let capture =
            detection.and_then(|detection| self.capture(detection, messages, coordinator));

        self.observed_len = messages.len();
        self.observed_content = coordinator
            .state()
            .regenerating_message_id()
            .and_then(|regenerating| find(messages, regenerating))
            .map(|index| messages[index].content.clone());
        capture
    }

    fn capture<S: AttemptSink>(
        &mut self,
        detection: Detection,
        messages: &mut Vec<Message>,
        coordinator: &mut RegenerationCoordinator<S>,
    ) -> Option<Capture> {
        let source = detection.candidate.id.clone();
        let merged = coordinator.capture_new_attempt(detection.candidate)?;

        let mut index = detection.index;
        messages[index] = merged.clone();
        if detection.path == CapturePath::Append
            && let Some(stale) = messages
                .iter()
                .enumerate()
                .position(|(position, message)| position != index && message.id == merged.id)
        {
            messages.remove(stale);
            if stale < index {
                index -= 1;
            }
        }

        tracing::info!(
            message_id = %merged.id,
            source_id = %source,
            path = ?detection.path,
            attempt_count = merged.attempt_count(),
            "captured regenerated response"
        );
        self.pending_append = None;
        self.tail = Some(LiveTail {
            source: source.clone(),
            host: merged.id.clone(),
        });

        Some(Capture {
            path: detection.path,
            index,
            source,
            message: merged,
        })
    }
}

fn find(messages: &[Message], message_id: &MessageId) -> Option<usize> {
    messages.iter().position(|message| &message.id == message_id)
}

/// A list entry as it is stored inside another message's attempts.
fn as_attempt(message: &Message) -> Message {
    Message {
        attempts: None,
        current_attempt_index: None,
        ..message.clone()
    }
}
