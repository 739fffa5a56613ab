use std::collections::HashMap;

use tokio::sync::RwLock;

use super::error::StorageResult;
use super::ids::{MessageId, StreamId, UserId};
use super::types::{NewStream, StatusTransition, StreamRecord, StreamStatus};
use super::{BoxFuture, StreamRecordStore, unix_timestamp_millis, validate_transition};

/// Process-local stream store. Each operation holds the write lock for its whole
/// compare-and-set, which gives the same single-update atomicity as the SQLite store.
#[derive(Debug, Default)]
pub struct MemoryStreamStore {
    records: RwLock<HashMap<StreamId, StreamRecord>>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl StreamRecordStore for MemoryStreamStore {
    fn insert_stream(&self, input: NewStream) -> BoxFuture<'_, StorageResult<StreamRecord>> {
        Box::pin(async move {
            let now = unix_timestamp_millis();
            let record = StreamRecord {
                id: StreamId::new_v7(),
                thread_id: input.thread_id,
                message_id: input.message_id,
                user_id: input.user_id,
                status: StreamStatus::Streaming,
                started_at_unix_millis: now,
                last_updated_at_unix_millis: now,
            };

            self.records.write().await.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn get_stream(
        &self,
        stream_id: StreamId,
    ) -> BoxFuture<'_, StorageResult<Option<StreamRecord>>> {
        Box::pin(async move { Ok(self.records.read().await.get(&stream_id).cloned()) })
    }

    fn interrupt_streaming(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let now = unix_timestamp_millis();
            let mut records = self.records.write().await;
            let mut updated = 0_u64;

            for record in records.values_mut() {
                if record.message_id == message_id && record.status == StreamStatus::Streaming {
                    record.status = StreamStatus::Paused;
                    record.last_updated_at_unix_millis = now;
                    updated += 1;
                }
            }

            Ok(updated)
        })
    }

    fn transition_stream(
        &self,
        stream_id: StreamId,
        transition: StatusTransition,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            validate_transition(&transition, "memory-stream-transition-validate")?;

            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&stream_id) else {
                return Ok(false);
            };

            if !transition.from.contains(&record.status) {
                return Ok(false);
            }

            record.status = transition.to;
            record.last_updated_at_unix_millis = unix_timestamp_millis();
            Ok(true)
        })
    }

    fn list_streams_by_status(
        &self,
        user_id: UserId,
        status: StreamStatus,
    ) -> BoxFuture<'_, StorageResult<Vec<StreamRecord>>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let mut matching = records
                .values()
                .filter(|record| record.user_id == user_id && record.status == status)
                .cloned()
                .collect::<Vec<_>>();

            matching.sort_by(|left, right| {
                right
                    .started_at_unix_millis
                    .cmp(&left.started_at_unix_millis)
                    .then_with(|| right.id.cmp(&left.id))
            });

            Ok(matching)
        })
    }

    fn list_streams_for_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Vec<StreamRecord>>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let mut matching = records
                .values()
                .filter(|record| record.message_id == message_id)
                .cloned()
                .collect::<Vec<_>>();

            matching.sort_by(|left, right| {
                left.started_at_unix_millis
                    .cmp(&right.started_at_unix_millis)
                    .then_with(|| left.id.cmp(&right.id))
            });

            Ok(matching)
        })
    }

    fn purge_terminal_streams(
        &self,
        updated_before_unix_millis: i64,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, record| {
                !(record.status.is_terminal()
                    && record.last_updated_at_unix_millis < updated_before_unix_millis)
            });

            Ok((before - records.len()) as u64)
        })
    }
}
