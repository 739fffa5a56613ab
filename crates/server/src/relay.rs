use std::collections::HashMap;
use std::time::{Duration, Instant};

use threadline_storage::StreamId;
use tokio::sync::{Mutex, broadcast, oneshot};

/// One unit of generation output as seen by HTTP subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Delta(String),
    Done,
    Failed(String),
}

impl RelayFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

/// Buffered output plus, while the stream is live, a receiver for what follows.
#[derive(Debug)]
pub struct RelaySubscription {
    pub replay: Vec<RelayFrame>,
    pub live: Option<broadcast::Receiver<RelayFrame>>,
}

impl RelaySubscription {
    pub fn is_finished(&self) -> bool {
        self.live.is_none()
    }

    pub fn replayed_text(&self) -> String {
        self.replay
            .iter()
            .filter_map(|frame| match frame {
                RelayFrame::Delta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

struct RelayEntry {
    frames: Vec<RelayFrame>,
    sender: broadcast::Sender<RelayFrame>,
    stop_tx: Option<oneshot::Sender<()>>,
    finished_at: Option<Instant>,
}

/// Per-stream replay buffers.
///
/// Publishing and subscribing happen under the same lock, so a subscriber sees every
/// frame exactly once: either in `replay` or on the live receiver.
#[derive(Default)]
pub struct StreamRelay {
    entries: Mutex<HashMap<StreamId, RelayEntry>>,
}

impl StreamRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a fresh buffer for the stream, replacing any previous one. The returned
    /// receiver fires when [`StreamRelay::stop`] is called or the buffer is replaced.
    pub async fn register(&self, stream_id: StreamId, capacity: usize) -> oneshot::Receiver<()> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let previous = self.entries.lock().await.insert(
            stream_id,
            RelayEntry {
                frames: Vec::new(),
                sender,
                stop_tx: Some(stop_tx),
                finished_at: None,
            },
        );

        if previous.is_some() {
            tracing::debug!(stream_id = %stream_id, "replaced existing relay buffer");
        }
        stop_rx
    }

    /// Appends a frame and forwards it to live subscribers. Frames for unknown or
    /// finished streams are dropped.
    pub async fn publish(&self, stream_id: StreamId, frame: RelayFrame) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&stream_id) else {
            tracing::debug!(stream_id = %stream_id, "dropping frame for unknown relay buffer");
            return;
        };
        if entry.finished_at.is_some() {
            return;
        }

        if frame.is_terminal() {
            entry.finished_at = Some(Instant::now());
            entry.stop_tx = None;
        }
        entry.frames.push(frame.clone());
        // No receivers is normal between a client dropping and a resume.
        let _ = entry.sender.send(frame);
    }

    pub async fn subscribe(&self, stream_id: StreamId) -> Option<RelaySubscription> {
        let entries = self.entries.lock().await;
        let entry = entries.get(&stream_id)?;
        Some(RelaySubscription {
            replay: entry.frames.clone(),
            live: entry
                .finished_at
                .is_none()
                .then(|| entry.sender.subscribe()),
        })
    }

    /// Signals the producer of a live buffer to stop. Returns false when nothing was running.
    pub async fn stop(&self, stream_id: StreamId) -> bool {
        let stop_tx = self
            .entries
            .lock()
            .await
            .get_mut(&stream_id)
            .and_then(|entry| entry.stop_tx.take());

        stop_tx.map(|tx| tx.send(()).is_ok()).unwrap_or(false)
    }

    /// Drops buffers that finished more than `retention` ago.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .finished_at
                .is_none_or(|finished_at| finished_at.elapsed() < retention)
        });
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
