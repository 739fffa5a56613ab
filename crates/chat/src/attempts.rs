use std::collections::HashMap;

use crate::message::{Message, MessageId};
use crate::regeneration::AttemptSink;

/// Cursor over a message's attempts. Movement clamps at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptNavigator {
    current_index: usize,
    attempt_count: usize,
}

impl AttemptNavigator {
    /// Returns `None` for fewer than two attempts, which get no navigation control.
    pub fn new(current_index: usize, attempt_count: usize) -> Option<Self> {
        if attempt_count < 2 {
            return None;
        }

        Some(Self {
            current_index: current_index.min(attempt_count - 1),
            attempt_count,
        })
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn attempt_count(&self) -> usize {
        self.attempt_count
    }

    pub fn has_previous(&self) -> bool {
        self.current_index > 0
    }

    pub fn has_next(&self) -> bool {
        self.current_index + 1 < self.attempt_count
    }

    pub fn previous(self) -> Self {
        Self {
            current_index: self.current_index.saturating_sub(1),
            ..self
        }
    }

    pub fn next(self) -> Self {
        Self {
            current_index: (self.current_index + 1).min(self.attempt_count - 1),
            ..self
        }
    }

    /// One-based position label, e.g. `2 / 3`.
    pub fn label(&self) -> String {
        format!("{} / {}", self.current_index + 1, self.attempt_count)
    }
}

#[derive(Debug, Clone)]
struct AttemptEntry {
    attempts: Vec<Message>,
    current_index: usize,
}

/// Captured attempts per message id plus the displayed-attempt cursor.
#[derive(Debug, Default)]
pub struct AttemptStore {
    entries: HashMap<MessageId, AttemptEntry>,
}

impl AttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the attempts carried by `message`.
    ///
    /// Captured sequences only grow. An unknown message keeps its own cursor (clamped,
    /// newest when absent). A longer sequence moves the cursor to the newest attempt; a
    /// same-length one refreshes the attempts in place and keeps the cursor. Shorter
    /// or single-attempt messages are ignored.
    pub fn record(&mut self, message: &Message) {
        let Some(attempts) = message.attempts.as_ref().filter(|attempts| attempts.len() >= 2)
        else {
            tracing::debug!(message_id = %message.id, "ignoring message without attempts");
            return;
        };

        let known = self
            .entries
            .get(&message.id)
            .map(|entry| entry.attempts.len());
        match known {
            Some(known) if attempts.len() < known => {
                tracing::debug!(
                    message_id = %message.id,
                    known,
                    offered = attempts.len(),
                    "ignoring shorter attempt sequence"
                );
            }
            Some(known) if attempts.len() == known => {
                if let Some(entry) = self.entries.get_mut(&message.id) {
                    entry.attempts = attempts.clone();
                }
            }
            Some(_) => {
                self.entries.insert(
                    message.id.clone(),
                    AttemptEntry {
                        attempts: attempts.clone(),
                        current_index: attempts.len() - 1,
                    },
                );
            }
            None => {
                let newest = attempts.len() - 1;
                let current_index = message
                    .current_attempt_index
                    .map_or(newest, |index| index.min(newest));
                self.entries.insert(
                    message.id.clone(),
                    AttemptEntry {
                        attempts: attempts.clone(),
                        current_index,
                    },
                );
            }
        }
    }

    pub fn attempts(&self, message_id: &MessageId) -> Option<&[Message]> {
        self.entries
            .get(message_id)
            .map(|entry| entry.attempts.as_slice())
    }

    pub fn current_index(&self, message_id: &MessageId) -> Option<usize> {
        self.entries.get(message_id).map(|entry| entry.current_index)
    }

    pub fn current(&self, message_id: &MessageId) -> Option<&Message> {
        let entry = self.entries.get(message_id)?;
        entry.attempts.get(entry.current_index)
    }

    pub fn navigator(&self, message_id: &MessageId) -> Option<AttemptNavigator> {
        let entry = self.entries.get(message_id)?;
        AttemptNavigator::new(entry.current_index, entry.attempts.len())
    }

    /// Steps the cursor back, returning the new index. No-op at index 0.
    pub fn previous(&mut self, message_id: &MessageId) -> Option<usize> {
        self.step(message_id, AttemptNavigator::previous)
    }

    /// Steps the cursor forward, returning the new index. No-op at the last index.
    pub fn next(&mut self, message_id: &MessageId) -> Option<usize> {
        self.step(message_id, AttemptNavigator::next)
    }

    /// Copies the stored cursor onto a list entry so it renders the selected attempt.
    pub fn apply_cursor(&self, message: &mut Message) {
        if let Some(index) = self.current_index(&message.id) {
            message.current_attempt_index = Some(index);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn step(
        &mut self,
        message_id: &MessageId,
        movement: fn(AttemptNavigator) -> AttemptNavigator,
    ) -> Option<usize> {
        let entry = self.entries.get_mut(message_id)?;
        let navigator = AttemptNavigator::new(entry.current_index, entry.attempts.len())?;
        entry.current_index = movement(navigator).current_index();
        Some(entry.current_index)
    }
}

impl AttemptSink for AttemptStore {
    fn attempt_captured(&mut self, merged: &Message) {
        self.record(merged);
    }
}
