use std::time::Duration;

use futures::future::BoxFuture;
use snafu::Snafu;
use threadline_storage::{MessageId, StreamId, ThreadId};
use tokio::sync::{mpsc, oneshot};

pub type GenerationWorker = BoxFuture<'static, ()>;
pub type GenerationResult<T> = Result<T, GenerationError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GenerationError {
    #[snafu(display("generation for message {message_id} is unavailable: {details}"))]
    Unavailable {
        stage: &'static str,
        message_id: MessageId,
        details: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub stream_id: StreamId,
    pub thread_id: ThreadId,
    pub message_id: MessageId,
    /// `None` when the request is re-issued without the original prompt, e.g. a
    /// resume after the replay buffer was lost.
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Delta(String),
    Done,
    Error(String),
}

/// Receiving end of one generation. Dropping it tells the worker to stop.
pub struct GenerationEvents {
    events: mpsc::UnboundedReceiver<GenerationEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct GenerationHandle {
    pub events: GenerationEvents,
    pub worker: GenerationWorker,
}

impl GenerationEvents {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<GenerationEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for GenerationEvents {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Model-generation collaborator: emits an incremental response for a message and
/// stops when told to.
pub trait GenerationService: Send + Sync {
    fn generate(&self, request: GenerationRequest) -> GenerationResult<GenerationHandle>;
}

pub(crate) fn make_event_stream() -> (
    mpsc::UnboundedSender<GenerationEvent>,
    GenerationEvents,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (event_tx, GenerationEvents::new(event_rx, cancel_tx), cancel_rx)
}

/// Development generator that streams the prompt back one word at a time.
#[derive(Debug, Clone)]
pub struct EchoGeneration {
    delay: Duration,
}

impl EchoGeneration {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    fn words(request: &GenerationRequest) -> Vec<String> {
        let text = match request.prompt.as_deref().map(str::trim) {
            Some(prompt) if !prompt.is_empty() => prompt.to_string(),
            _ => format!("regenerated response for {}", request.message_id),
        };

        let mut words = text
            .split_whitespace()
            .map(|word| format!("{word} "))
            .collect::<Vec<_>>();
        if let Some(last) = words.last_mut() {
            last.truncate(last.trim_end().len());
        }
        words
    }

    async fn run_worker(
        delay: Duration,
        words: Vec<String>,
        event_tx: mpsc::UnboundedSender<GenerationEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for word in words {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!("echo generation cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {
                    if event_tx.send(GenerationEvent::Delta(word)).is_err() {
                        return;
                    }
                }
            }
        }

        let _ = event_tx.send(GenerationEvent::Done);
    }
}

impl Default for EchoGeneration {
    fn default() -> Self {
        Self::new(Duration::from_millis(25))
    }
}

impl GenerationService for EchoGeneration {
    fn generate(&self, request: GenerationRequest) -> GenerationResult<GenerationHandle> {
        let (event_tx, events, cancel_rx) = make_event_stream();
        let words = Self::words(&request);
        tracing::debug!(
            stream_id = %request.stream_id,
            message_id = %request.message_id,
            word_count = words.len(),
            "echo generation scheduled"
        );

        Ok(GenerationHandle {
            events,
            worker: Box::pin(Self::run_worker(self.delay, words, event_tx, cancel_rx)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: Option<&str>) -> GenerationRequest {
        GenerationRequest {
            stream_id: StreamId::new_v7(),
            thread_id: ThreadId::parse("t1").expect("thread id"),
            message_id: MessageId::parse("m1").expect("message id"),
            prompt: prompt.map(str::to_string),
        }
    }

    async fn collect(mut events: GenerationEvents) -> Vec<GenerationEvent> {
        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
        collected
    }

    #[tokio::test]
    async fn echo_streams_words_then_done() {
        let handle = EchoGeneration::new(Duration::ZERO)
            .generate(request(Some("hello  there")))
            .expect("generate");
        tokio::spawn(handle.worker);

        let events = collect(handle.events).await;
        assert_eq!(
            events,
            vec![
                GenerationEvent::Delta("hello ".to_string()),
                GenerationEvent::Delta("there".to_string()),
                GenerationEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn echo_without_prompt_still_produces_output() {
        let handle = EchoGeneration::new(Duration::ZERO)
            .generate(request(None))
            .expect("generate");
        tokio::spawn(handle.worker);

        let events = collect(handle.events).await;
        assert!(events.len() > 1);
        assert_eq!(events.last(), Some(&GenerationEvent::Done));
    }

    #[tokio::test]
    async fn cancelled_generation_stops_without_done() {
        let mut handle = EchoGeneration::new(Duration::from_secs(60))
            .generate(request(Some("never delivered")))
            .expect("generate");
        assert!(handle.events.cancel());
        handle.worker.await;

        assert_eq!(handle.events.recv().await, None);
    }
}
