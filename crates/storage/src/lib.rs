pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, StreamId, ThreadId, UserId};
pub use memory::MemoryStreamStore;
pub use sqlite::SqliteStreamStore;
pub use types::{NewStream, StatusTransition, StreamRecord, StreamStatus};

use error::{InvalidTransitionSnafu, InvariantViolationSnafu};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable table of stream metadata.
///
/// Every mutating call is a single conditional update scoped by the current status,
/// so concurrent callers racing on the same record never observe a torn state: the
/// loser sees `0` / `false` instead.
pub trait StreamRecordStore: Send + Sync {
    fn insert_stream(&self, input: NewStream) -> BoxFuture<'_, StorageResult<StreamRecord>>;

    fn get_stream(&self, stream_id: StreamId)
    -> BoxFuture<'_, StorageResult<Option<StreamRecord>>>;

    /// Moves every `streaming` record of `message_id` to `paused`, returning how many moved.
    fn interrupt_streaming(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<u64>>;

    /// Applies `transition` to one record. Returns false when the record was not in
    /// any of the expected source states (including when it does not exist).
    fn transition_stream(
        &self,
        stream_id: StreamId,
        transition: StatusTransition,
    ) -> BoxFuture<'_, StorageResult<bool>>;

    /// Records owned by `user_id` in `status`, most recently started first.
    fn list_streams_by_status(
        &self,
        user_id: UserId,
        status: StreamStatus,
    ) -> BoxFuture<'_, StorageResult<Vec<StreamRecord>>>;

    /// Every record ever created for `message_id`, oldest first.
    fn list_streams_for_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Vec<StreamRecord>>>;

    /// Deletes terminal records last updated before the cutoff.
    fn purge_terminal_streams(
        &self,
        updated_before_unix_millis: i64,
    ) -> BoxFuture<'_, StorageResult<u64>>;
}

pub fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

pub(crate) fn validate_transition(
    transition: &StatusTransition,
    stage: &'static str,
) -> StorageResult<()> {
    if transition.from.is_empty() {
        return InvariantViolationSnafu {
            stage,
            details: "status transition needs at least one source status".to_string(),
        }
        .fail();
    }

    for from in &transition.from {
        if !from.can_transition_to(transition.to) {
            return InvalidTransitionSnafu {
                stage,
                from: *from,
                to: transition.to,
            }
            .fail();
        }
    }

    Ok(())
}
