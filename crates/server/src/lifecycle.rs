use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use threadline_storage::{
    MessageId, NewStream, StatusTransition, StorageError, StreamId, StreamRecord,
    StreamRecordStore, StreamStatus, ThreadId, UserId, unix_timestamp_millis,
};

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LifecycleError {
    #[snafu(display("stream {stream_id} is not resumable from status '{status}'"))]
    NotResumable {
        stage: &'static str,
        stream_id: StreamId,
        status: StreamStatus,
    },
    #[snafu(display("stream {stream_id} was not found"))]
    StreamNotFound {
        stage: &'static str,
        stream_id: StreamId,
    },
    #[snafu(display("stream storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

/// State-machine operations over the stream record table.
///
/// Every mutation is delegated to a single conditional update in the store, so
/// concurrent callers never need a lock here.
#[derive(Clone)]
pub struct StreamLifecycle {
    store: Arc<dyn StreamRecordStore>,
}

impl StreamLifecycle {
    pub fn new(store: Arc<dyn StreamRecordStore>) -> Self {
        Self { store }
    }

    /// Creates a record in `streaming`. Callers that need the one-streaming-record
    /// per message guarantee use [`StreamLifecycle::begin`].
    pub async fn start(
        &self,
        thread_id: ThreadId,
        message_id: MessageId,
        user_id: UserId,
    ) -> LifecycleResult<StreamRecord> {
        let record = self
            .store
            .insert_stream(NewStream {
                thread_id,
                message_id,
                user_id,
            })
            .await
            .context(StorageSnafu {
                stage: "lifecycle-start-insert",
            })?;

        tracing::info!(
            stream_id = %record.id,
            message_id = %record.message_id,
            user_id = %record.user_id,
            "stream started"
        );
        Ok(record)
    }

    /// Interrupts whatever is still streaming for the message, then starts a new record.
    pub async fn begin(
        &self,
        thread_id: ThreadId,
        message_id: MessageId,
        user_id: UserId,
    ) -> LifecycleResult<StreamRecord> {
        let superseded = self.mark_interrupted(&message_id).await?;
        if superseded > 0 {
            tracing::debug!(
                message_id = %message_id,
                updated_count = superseded,
                "paused previous stream before starting a new one"
            );
        }

        self.start(thread_id, message_id, user_id).await
    }

    /// Moves every `streaming` record of the message to `paused`. Returns `0` when
    /// nothing was streaming, which callers treat as success.
    pub async fn mark_interrupted(&self, message_id: &MessageId) -> LifecycleResult<u64> {
        let updated = self
            .store
            .interrupt_streaming(message_id.clone())
            .await
            .context(StorageSnafu {
                stage: "lifecycle-mark-interrupted",
            })?;

        if updated == 0 {
            tracing::debug!(message_id = %message_id, "interrupt matched no streaming record");
        } else {
            tracing::info!(message_id = %message_id, updated_count = updated, "stream interrupted");
        }
        Ok(updated)
    }

    pub async fn list_resumable(&self, user_id: &UserId) -> LifecycleResult<Vec<StreamRecord>> {
        self.store
            .list_streams_by_status(user_id.clone(), StreamStatus::Paused)
            .await
            .context(StorageSnafu {
                stage: "lifecycle-list-resumable",
            })
    }

    /// `paused → resumed`. Exactly one of several racing callers wins; the others
    /// get [`LifecycleError::NotResumable`] with the status they lost to.
    pub async fn resume(&self, stream_id: StreamId) -> LifecycleResult<StreamRecord> {
        let applied = self
            .store
            .transition_stream(
                stream_id,
                StatusTransition::single(StreamStatus::Paused, StreamStatus::Resumed),
            )
            .await
            .context(StorageSnafu {
                stage: "lifecycle-resume-transition",
            })?;

        let record = self.get(stream_id).await?;
        if !applied {
            return NotResumableSnafu {
                stage: "lifecycle-resume",
                stream_id,
                status: record.status,
            }
            .fail();
        }

        tracing::info!(stream_id = %stream_id, message_id = %record.message_id, "stream resumed");
        Ok(record)
    }

    /// `resumed → streaming` once output is flowing again. Anything else still
    /// streaming for the same message is paused first.
    pub async fn restart(&self, stream_id: StreamId) -> LifecycleResult<bool> {
        let record = self.get(stream_id).await?;
        self.mark_interrupted(&record.message_id).await?;

        let applied = self
            .transition(
                stream_id,
                StatusTransition::single(StreamStatus::Resumed, StreamStatus::Streaming),
                "lifecycle-restart",
            )
            .await?;
        if applied {
            tracing::info!(stream_id = %stream_id, "stream restarted");
        }
        Ok(applied)
    }

    /// `streaming → paused` for one record, used when its generation fails mid-way.
    pub async fn pause(&self, stream_id: StreamId) -> LifecycleResult<bool> {
        let applied = self
            .transition(
                stream_id,
                StatusTransition::single(StreamStatus::Streaming, StreamStatus::Paused),
                "lifecycle-pause",
            )
            .await?;
        if applied {
            tracing::info!(stream_id = %stream_id, "stream paused");
        }
        Ok(applied)
    }

    pub async fn complete(&self, stream_id: StreamId) -> LifecycleResult<bool> {
        let applied = self
            .transition(
                stream_id,
                StatusTransition::new(
                    [StreamStatus::Streaming, StreamStatus::Resumed],
                    StreamStatus::Completed,
                ),
                "lifecycle-complete",
            )
            .await?;
        if applied {
            tracing::info!(stream_id = %stream_id, "stream completed");
        } else {
            tracing::debug!(stream_id = %stream_id, "completion skipped, stream not active");
        }
        Ok(applied)
    }

    pub async fn cancel(&self, stream_id: StreamId) -> LifecycleResult<bool> {
        let applied = self
            .transition(
                stream_id,
                StatusTransition::new(StreamStatus::NON_TERMINAL, StreamStatus::Cancelled),
                "lifecycle-cancel",
            )
            .await?;
        if applied {
            tracing::info!(stream_id = %stream_id, "stream cancelled");
        }
        Ok(applied)
    }

    pub async fn get(&self, stream_id: StreamId) -> LifecycleResult<StreamRecord> {
        let record = self.store.get_stream(stream_id).await.context(StorageSnafu {
            stage: "lifecycle-get",
        })?;

        match record {
            Some(record) => Ok(record),
            None => StreamNotFoundSnafu {
                stage: "lifecycle-get",
                stream_id,
            }
            .fail(),
        }
    }

    pub async fn history(&self, message_id: &MessageId) -> LifecycleResult<Vec<StreamRecord>> {
        self.store
            .list_streams_for_message(message_id.clone())
            .await
            .context(StorageSnafu {
                stage: "lifecycle-history",
            })
    }

    /// Deletes `completed` and `cancelled` records untouched for longer than `older_than`.
    pub async fn purge_terminal(&self, older_than: Duration) -> LifecycleResult<u64> {
        let cutoff = unix_timestamp_millis()
            .saturating_sub(i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX));
        self.store
            .purge_terminal_streams(cutoff)
            .await
            .context(StorageSnafu {
                stage: "lifecycle-purge-terminal",
            })
    }

    async fn transition(
        &self,
        stream_id: StreamId,
        transition: StatusTransition,
        stage: &'static str,
    ) -> LifecycleResult<bool> {
        self.store
            .transition_stream(stream_id, transition)
            .await
            .context(StorageSnafu { stage })
    }
}

#[cfg(test)]
mod tests {
    use threadline_storage::MemoryStreamStore;

    use super::*;

    fn lifecycle() -> StreamLifecycle {
        StreamLifecycle::new(Arc::new(MemoryStreamStore::new()))
    }

    fn ids(message: &str, user: &str) -> (ThreadId, MessageId, UserId) {
        (
            ThreadId::parse("t1").expect("thread id"),
            MessageId::parse(message).expect("message id"),
            UserId::parse(user).expect("user id"),
        )
    }

    async fn paused_stream(lifecycle: &StreamLifecycle, message: &str) -> StreamRecord {
        let (thread_id, message_id, user_id) = ids(message, "u1");
        let record = lifecycle
            .start(thread_id, message_id.clone(), user_id)
            .await
            .expect("start");
        lifecycle.mark_interrupted(&message_id).await.expect("interrupt");
        record
    }

    #[tokio::test]
    async fn mark_interrupted_is_idempotent() {
        let lifecycle = lifecycle();
        let (thread_id, message_id, user_id) = ids("m1", "u1");
        lifecycle
            .start(thread_id, message_id.clone(), user_id)
            .await
            .expect("start");

        assert_eq!(lifecycle.mark_interrupted(&message_id).await.expect("first"), 1);
        assert_eq!(lifecycle.mark_interrupted(&message_id).await.expect("second"), 0);

        let missing = MessageId::parse("missing-id").expect("message id");
        assert_eq!(lifecycle.mark_interrupted(&missing).await.expect("missing"), 0);
    }

    #[tokio::test]
    async fn begin_keeps_one_streaming_record_per_message() {
        let lifecycle = lifecycle();
        let (thread_id, message_id, user_id) = ids("m1", "u1");
        let first = lifecycle
            .begin(thread_id.clone(), message_id.clone(), user_id.clone())
            .await
            .expect("first begin");
        let second = lifecycle
            .begin(thread_id, message_id.clone(), user_id)
            .await
            .expect("second begin");

        let history = lifecycle.history(&message_id).await.expect("history");
        let streaming = history
            .iter()
            .filter(|record| record.status == StreamStatus::Streaming)
            .map(|record| record.id)
            .collect::<Vec<_>>();
        assert_eq!(streaming, vec![second.id]);
        assert_eq!(
            lifecycle.get(first.id).await.expect("first").status,
            StreamStatus::Paused
        );
    }

    #[tokio::test]
    async fn concurrent_resume_has_one_winner_and_one_not_resumable() {
        let lifecycle = lifecycle();
        let record = paused_stream(&lifecycle, "m1").await;

        let (left, right) = tokio::join!(lifecycle.resume(record.id), lifecycle.resume(record.id));
        let outcomes = [left, right];
        let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        let losers = outcomes
            .iter()
            .filter(|outcome| {
                matches!(
                    outcome,
                    Err(LifecycleError::NotResumable {
                        status: StreamStatus::Resumed,
                        ..
                    })
                )
            })
            .count();

        assert_eq!(winners, 1);
        assert_eq!(losers, 1);
    }

    #[tokio::test]
    async fn resume_of_streaming_record_is_rejected() {
        let lifecycle = lifecycle();
        let (thread_id, message_id, user_id) = ids("m1", "u1");
        let record = lifecycle
            .start(thread_id, message_id, user_id)
            .await
            .expect("start");

        let error = lifecycle.resume(record.id).await.expect_err("not paused");
        assert!(matches!(
            error,
            LifecycleError::NotResumable {
                status: StreamStatus::Streaming,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resume_of_unknown_record_reports_not_found() {
        let error = lifecycle()
            .resume(StreamId::new_v7())
            .await
            .expect_err("unknown stream");
        assert!(matches!(error, LifecycleError::StreamNotFound { .. }));
    }

    #[tokio::test]
    async fn restart_moves_resumed_record_back_to_streaming() {
        let lifecycle = lifecycle();
        let record = paused_stream(&lifecycle, "m1").await;
        lifecycle.resume(record.id).await.expect("resume");

        assert!(lifecycle.restart(record.id).await.expect("restart"));
        assert_eq!(
            lifecycle.get(record.id).await.expect("get").status,
            StreamStatus::Streaming
        );
        assert!(!lifecycle.restart(record.id).await.expect("second restart"));
    }

    #[tokio::test]
    async fn complete_and_cancel_respect_source_states() {
        let lifecycle = lifecycle();
        let record = paused_stream(&lifecycle, "m1").await;

        assert!(!lifecycle.complete(record.id).await.expect("complete paused"));
        assert!(!lifecycle.pause(record.id).await.expect("pause paused"));
        assert!(lifecycle.cancel(record.id).await.expect("cancel paused"));
        assert!(!lifecycle.cancel(record.id).await.expect("cancel twice"));
    }

    #[tokio::test]
    async fn list_resumable_only_returns_callers_paused_records() {
        let lifecycle = lifecycle();
        let own = paused_stream(&lifecycle, "m1").await;
        let (thread_id, message_id, user_id) = ids("m2", "u2");
        lifecycle
            .start(thread_id, message_id.clone(), user_id)
            .await
            .expect("start foreign");
        lifecycle.mark_interrupted(&message_id).await.expect("interrupt foreign");

        let listed = lifecycle
            .list_resumable(&UserId::parse("u1").expect("user id"))
            .await
            .expect("list");
        assert_eq!(
            listed.iter().map(|record| record.id).collect::<Vec<_>>(),
            vec![own.id]
        );
    }

    #[tokio::test]
    async fn purge_terminal_keeps_recent_records() {
        let lifecycle = lifecycle();
        let (thread_id, message_id, user_id) = ids("m1", "u1");
        let record = lifecycle
            .start(thread_id, message_id, user_id)
            .await
            .expect("start");
        lifecycle.complete(record.id).await.expect("complete");

        let purged = lifecycle
            .purge_terminal(Duration::from_secs(3600))
            .await
            .expect("purge");
        assert_eq!(purged, 0);
        assert!(lifecycle.get(record.id).await.is_ok());
    }
}
