use snafu::OptionExt;
use tokio::task::JoinHandle;

use crate::attempts::{AttemptNavigator, AttemptStore};
use crate::interceptor::{Capture, MessageInterceptor, MessageListEvent};
use crate::message::{Message, MessageId};
use crate::regeneration::{
    RegenerationCoordinator, RegenerationResult, StartPolicy, UnknownMessageSnafu,
};
use crate::tracker::{ClientStreamTracker, TeardownGuard, TeardownReport};

/// One conversation view: the live message list plus the regeneration machinery
/// that watches it.
///
/// Every state change goes through `&mut self`, so events are handled strictly in
/// arrival order. Dropping the session sends interrupts for streams it still tracks.
pub struct ChatSession {
    messages: Vec<Message>,
    coordinator: RegenerationCoordinator<AttemptStore>,
    interceptor: MessageInterceptor,
    guard: TeardownGuard,
}

impl ChatSession {
    pub fn new(tracker: ClientStreamTracker, policy: StartPolicy) -> Self {
        Self {
            messages: Vec::new(),
            coordinator: RegenerationCoordinator::with_policy(AttemptStore::new(), policy),
            interceptor: MessageInterceptor::new(),
            guard: TeardownGuard::new(tracker),
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.load(messages);
        self
    }

    /// Replaces the list, e.g. after fetching a thread. Attempts already carried by
    /// the loaded messages become navigable.
    pub fn load(&mut self, messages: Vec<Message>) {
        for message in &messages {
            self.coordinator.sink_mut().record(message);
        }
        self.messages = messages;
        self.sync_all_cursors();
        self.interceptor.reset(&self.messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn coordinator(&self) -> &RegenerationCoordinator<AttemptStore> {
        &self.coordinator
    }

    pub fn attempts(&self) -> &AttemptStore {
        self.coordinator.sink()
    }

    pub fn tracker(&self) -> &ClientStreamTracker {
        self.guard.tracker()
    }

    /// Starts regenerating `message_id`. The caller issues the generation request.
    pub fn regenerate(&mut self, message_id: &MessageId) -> RegenerationResult<()> {
        let message = self
            .messages
            .iter()
            .find(|message| &message.id == message_id)
            .context(UnknownMessageSnafu {
                stage: "regenerate",
                message_id: message_id.clone(),
            })?;

        self.coordinator
            .start_regeneration(message_id.clone(), message)?;
        self.interceptor.begin(&self.messages, message_id);
        self.tracker().track(message_id.clone());
        Ok(())
    }

    /// Applies one list event and returns the capture it produced, if any.
    pub fn apply(&mut self, event: MessageListEvent) -> Option<Capture> {
        if let MessageListEvent::ContentChanged {
            message_id,
            content,
        } = &event
            && let Some(host) = self
                .interceptor
                .follow_tail(message_id, content, &mut self.messages)
        {
            self.coordinator.sink_mut().record(&host);
            return None;
        }

        if !event.apply_to(&mut self.messages) {
            tracing::debug!(event = ?event, "list event target is missing");
        }
        match &event {
            MessageListEvent::Removed(message_id) => self.interceptor.release(message_id),
            MessageListEvent::Reset(messages) => {
                for message in messages {
                    self.coordinator.sink_mut().record(message);
                }
                self.sync_all_cursors();
            }
            _ => {}
        }

        let capture = self
            .interceptor
            .observe(&event, &mut self.messages, &mut self.coordinator)?;
        if capture.source != capture.message.id {
            let tracker = self.tracker();
            tracker.untrack(&capture.message.id);
            tracker.track(capture.source.clone());
        }
        Some(capture)
    }

    /// The stream for `message_id` ended normally.
    pub fn stream_finished(&mut self, message_id: &MessageId) {
        self.settle(message_id);
    }

    /// The generation for `message_id` failed. The server keeps the record resumable.
    pub fn generation_failed(&mut self, message_id: &MessageId) {
        tracing::debug!(message_id = %message_id, "generation failed");
        self.settle(message_id);
    }

    pub fn previous_attempt(&mut self, message_id: &MessageId) -> Option<usize> {
        let index = self.coordinator.sink_mut().previous(message_id)?;
        self.sync_cursor(message_id);
        Some(index)
    }

    pub fn next_attempt(&mut self, message_id: &MessageId) -> Option<usize> {
        let index = self.coordinator.sink_mut().next(message_id)?;
        self.sync_cursor(message_id);
        Some(index)
    }

    pub fn navigator(&self, message_id: &MessageId) -> Option<AttemptNavigator> {
        self.attempts().navigator(message_id)
    }

    /// Forced teardown of the view: no regeneration survives it and every tracked
    /// stream is reported as interrupted.
    pub fn teardown(&mut self) -> Option<JoinHandle<TeardownReport>> {
        self.coordinator.finish_regeneration();
        self.interceptor.reset(&self.messages);
        self.tracker().teardown()
    }

    fn settle(&mut self, message_id: &MessageId) {
        let regenerating = self.coordinator.state().regenerating_message_id() == Some(message_id);
        if regenerating {
            self.coordinator.finish_regeneration();
        }
        self.interceptor.release(message_id);
        self.tracker().untrack(message_id);
    }

    /// List entries render the cursor held by the attempt store.
    fn sync_all_cursors(&mut self) {
        let store = self.coordinator.sink();
        for message in &mut self.messages {
            store.apply_cursor(message);
        }
    }

    fn sync_cursor(&mut self, message_id: &MessageId) {
        if let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| &message.id == message_id)
        {
            self.coordinator.sink().apply_cursor(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;

    use super::*;
    use crate::interceptor::CapturePath;
    use crate::regeneration::RegenerationError;
    use crate::tracker::{InterruptAck, InterruptNotifier, NotifyResult};

    #[derive(Default)]
    struct Notified(Mutex<Vec<MessageId>>);

    impl InterruptNotifier for Notified {
        fn notify_interrupted<'a>(
            &'a self,
            message_id: &'a MessageId,
        ) -> BoxFuture<'a, NotifyResult<InterruptAck>> {
            Box::pin(async move {
                if let Ok(mut notified) = self.0.lock() {
                    notified.push(message_id.clone());
                }
                Ok(InterruptAck {
                    success: true,
                    updated: 1,
                })
            })
        }
    }

    fn session() -> (ChatSession, Arc<Notified>) {
        let notified = Arc::new(Notified::default());
        let tracker = ClientStreamTracker::new(notified.clone());
        let session = ChatSession::new(tracker, StartPolicy::default()).with_messages(vec![
            Message::user("u1", "question"),
            Message::assistant("m1", "A"),
            Message::user("u2", "follow up"),
        ]);
        (session, notified)
    }

    fn notified_ids(notified: &Notified) -> Vec<MessageId> {
        notified.0.lock().map(|ids| ids.clone()).unwrap_or_default()
    }

    #[test]
    fn regenerating_unknown_message_fails() {
        let (mut session, _) = session();
        let error = session
            .regenerate(&"missing".into())
            .expect_err("unknown message");
        assert!(matches!(error, RegenerationError::UnknownMessage { .. }));
        assert!(!session.coordinator().is_regenerating());
    }

    #[test]
    fn appended_response_is_captured_once_and_streams_into_the_attempt() {
        let (mut session, _) = session();
        let m1 = MessageId::new("m1");
        session.regenerate(&m1).expect("regenerate");
        assert!(session.tracker().is_tracked(&m1));

        let capture = session
            .apply(MessageListEvent::Appended(Message::assistant("m2", "B")))
            .expect("append path fired");
        assert_eq!(capture.path, CapturePath::Append);
        assert_eq!(capture.source, MessageId::new("m2"));
        assert!(session.tracker().is_tracked(&"m2".into()));
        assert!(!session.tracker().is_tracked(&m1));

        assert!(
            session
                .apply(MessageListEvent::ContentChanged {
                    message_id: "m2".into(),
                    content: "B continued".to_string(),
                })
                .is_none()
        );
        assert!(
            session
                .apply(MessageListEvent::Appended(Message::user("u3", "next")))
                .is_none()
        );

        let attempts = session.attempts().attempts(&m1).expect("attempts");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].content, "A");
        assert_eq!(attempts[1].content, "B continued");

        session.stream_finished(&"m2".into());
        assert!(session.tracker().is_empty());
    }

    #[test]
    fn navigation_clamps_and_updates_the_list_entry() {
        let (mut session, _) = session();
        let m1 = MessageId::new("m1");
        session.regenerate(&m1).expect("regenerate");
        session.apply(MessageListEvent::ContentChanged {
            message_id: m1.clone(),
            content: "B".to_string(),
        });

        assert_eq!(session.next_attempt(&m1), Some(1));
        assert_eq!(session.navigator(&m1).map(|n| n.current_index()), Some(1));

        assert_eq!(session.previous_attempt(&m1), Some(0));
        let entry = session
            .messages()
            .iter()
            .find(|message| message.id == m1)
            .expect("entry");
        assert_eq!(entry.displayed_content(), "A");
    }

    fn reloaded(current_attempt_index: Option<usize>) -> Message {
        let mut message = Message::assistant("m1", "A");
        message.attempts = Some(vec![
            Message::assistant("m1", "A"),
            Message::assistant("m2", "B"),
            Message::assistant("m3", "C"),
        ]);
        message.current_attempt_index = current_attempt_index;
        message
    }

    fn displayed(session: &ChatSession, message_id: &MessageId) -> String {
        session
            .messages()
            .iter()
            .find(|message| &message.id == message_id)
            .map(|message| message.displayed_content().to_string())
            .unwrap_or_default()
    }

    #[test]
    fn reloaded_cursor_matches_the_rendered_attempt() {
        let (mut session, _) = session();
        let m1 = MessageId::new("m1");
        session.load(vec![Message::user("u1", "question"), reloaded(Some(0))]);

        assert_eq!(displayed(&session, &m1), "A");
        assert_eq!(session.navigator(&m1).map(|n| n.current_index()), Some(0));
        assert_eq!(session.previous_attempt(&m1), Some(0));
        assert_eq!(displayed(&session, &m1), "A");

        assert_eq!(session.next_attempt(&m1), Some(1));
        assert_eq!(displayed(&session, &m1), "B");
    }

    #[test]
    fn reset_without_cursor_renders_the_newest_attempt() {
        let (mut session, _) = session();
        let m1 = MessageId::new("m1");
        session.apply(MessageListEvent::Reset(vec![reloaded(None)]));

        assert_eq!(session.navigator(&m1).map(|n| n.current_index()), Some(2));
        assert_eq!(displayed(&session, &m1), "C");
        assert_eq!(session.next_attempt(&m1), Some(2));
    }

    #[test]
    fn finished_stream_without_capture_releases_the_coordinator() {
        let (mut session, _) = session();
        let m1 = MessageId::new("m1");
        session.regenerate(&m1).expect("regenerate");

        session.generation_failed(&m1);
        assert!(!session.coordinator().is_regenerating());
        assert!(!session.tracker().is_tracked(&m1));
    }

    #[tokio::test]
    async fn forced_teardown_leaves_nothing_regenerating() {
        let (mut session, notified) = session();
        let m1 = MessageId::new("m1");
        session.regenerate(&m1).expect("regenerate");

        let report = session
            .teardown()
            .expect("runtime available")
            .await
            .expect("teardown task");

        assert!(!session.coordinator().is_regenerating());
        assert_eq!(report.acknowledged, vec![m1.clone()]);
        assert_eq!(notified_ids(&notified), vec![m1]);
    }

    #[tokio::test]
    async fn dropping_the_session_reports_tracked_streams() {
        let (mut session, notified) = session();
        let m1 = MessageId::new("m1");
        session.regenerate(&m1).expect("regenerate");
        let tracker = session.tracker().clone();

        drop(session);
        for _ in 0..50 {
            if tracker.is_empty() && !notified_ids(&notified).is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(notified_ids(&notified), vec![m1]);
    }
}
