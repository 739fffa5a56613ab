use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::{MessageId, StreamId, ThreadId, UserId};
use super::types::{NewStream, StatusTransition, StreamRecord, StreamStatus};
use super::{BoxFuture, StreamRecordStore, unix_timestamp_millis, validate_transition};

const STREAM_COLUMNS: &str =
    "id, thread_id, message_id, user_id, status, started_at, last_updated_at";

#[derive(Debug, Clone)]
pub struct SqliteStreamStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStreamStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `:memory:` databases alive for the pool's
        // lifetime and serializes writers, which the conditional updates rely on.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite stream store");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

impl StreamRecordStore for SqliteStreamStore {
    fn insert_stream(&self, input: NewStream) -> BoxFuture<'_, StorageResult<StreamRecord>> {
        Box::pin(async move {
            let stream_id = StreamId::new_v7();
            let now = unix_timestamp_millis();

            sqlx::query(
                "INSERT INTO stream_records (id, thread_id, message_id, user_id, status, started_at, last_updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(stream_id.to_string())
            .bind(input.thread_id.as_str())
            .bind(input.message_id.as_str())
            .bind(input.user_id.as_str())
            .bind(StreamStatus::Streaming.as_str())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "stream-insert",
            })?;

            Ok(StreamRecord {
                id: stream_id,
                thread_id: input.thread_id,
                message_id: input.message_id,
                user_id: input.user_id,
                status: StreamStatus::Streaming,
                started_at_unix_millis: now,
                last_updated_at_unix_millis: now,
            })
        })
    }

    fn get_stream(
        &self,
        stream_id: StreamId,
    ) -> BoxFuture<'_, StorageResult<Option<StreamRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, StreamRow>(&format!(
                "SELECT {STREAM_COLUMNS} FROM stream_records WHERE id = ?"
            ))
            .bind(stream_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "stream-get-query",
            })?;

            row.map(stream_row_to_record).transpose()
        })
    }

    fn interrupt_streaming(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE stream_records SET status = ?, last_updated_at = ? WHERE message_id = ? AND status = ?",
            )
            .bind(StreamStatus::Paused.as_str())
            .bind(unix_timestamp_millis())
            .bind(message_id.as_str())
            .bind(StreamStatus::Streaming.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "stream-interrupt-apply",
            })?;

            Ok(result.rows_affected())
        })
    }

    fn transition_stream(
        &self,
        stream_id: StreamId,
        transition: StatusTransition,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            validate_transition(&transition, "stream-transition-validate")?;

            let placeholders = vec!["?"; transition.from.len()].join(", ");
            let statement = format!(
                "UPDATE stream_records SET status = ?, last_updated_at = ? WHERE id = ? AND status IN ({placeholders})"
            );

            let mut query = sqlx::query(&statement)
                .bind(transition.to.as_str())
                .bind(unix_timestamp_millis())
                .bind(stream_id.to_string());
            for from in &transition.from {
                query = query.bind(from.as_str());
            }

            let result = query.execute(&self.pool).await.context(SqliteQuerySnafu {
                stage: "stream-transition-apply",
            })?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn list_streams_by_status(
        &self,
        user_id: UserId,
        status: StreamStatus,
    ) -> BoxFuture<'_, StorageResult<Vec<StreamRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, StreamRow>(&format!(
                "SELECT {STREAM_COLUMNS} FROM stream_records WHERE user_id = ? AND status = ? ORDER BY started_at DESC, id DESC"
            ))
            .bind(user_id.as_str())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "stream-list-by-status-query",
            })?;

            rows.into_iter().map(stream_row_to_record).collect()
        })
    }

    fn list_streams_for_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Vec<StreamRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, StreamRow>(&format!(
                "SELECT {STREAM_COLUMNS} FROM stream_records WHERE message_id = ? ORDER BY started_at ASC, id ASC"
            ))
            .bind(message_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "stream-list-for-message-query",
            })?;

            rows.into_iter().map(stream_row_to_record).collect()
        })
    }

    fn purge_terminal_streams(
        &self,
        updated_before_unix_millis: i64,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM stream_records WHERE status IN (?, ?) AND last_updated_at < ?",
            )
            .bind(StreamStatus::Completed.as_str())
            .bind(StreamStatus::Cancelled.as_str())
            .bind(updated_before_unix_millis)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "stream-purge-terminal",
            })?;

            Ok(result.rows_affected())
        })
    }
}

#[derive(Debug, FromRow)]
struct StreamRow {
    id: String,
    thread_id: String,
    message_id: String,
    user_id: String,
    status: String,
    started_at: i64,
    last_updated_at: i64,
}

fn stream_row_to_record(row: StreamRow) -> StorageResult<StreamRecord> {
    Ok(StreamRecord {
        id: StreamId::parse(&row.id)?,
        thread_id: ThreadId::parse(&row.thread_id)?,
        message_id: MessageId::parse(&row.message_id)?,
        user_id: UserId::parse(&row.user_id)?,
        status: StreamStatus::parse(&row.status)?,
        started_at_unix_millis: row.started_at,
        last_updated_at_unix_millis: row.last_updated_at,
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory_store() -> SqliteStreamStore {
        SqliteStreamStore::open(":memory:")
            .await
            .expect("in-memory sqlite store")
    }

    fn new_stream(message: &str, user: &str) -> NewStream {
        NewStream {
            thread_id: ThreadId::parse("thread-1").expect("thread id"),
            message_id: MessageId::parse(message).expect("message id"),
            user_id: UserId::parse(user).expect("user id"),
        }
    }

    #[test]
    fn database_locations_normalize_to_sqlite_urls() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(
            normalize_database_url("data/streams.db"),
            "sqlite://data/streams.db"
        );
    }

    #[tokio::test]
    async fn inserted_stream_starts_streaming_and_reads_back() {
        let store = open_memory_store().await;
        let record = store
            .insert_stream(new_stream("m1", "u1"))
            .await
            .expect("insert");

        assert_eq!(record.status, StreamStatus::Streaming);
        assert_eq!(record.started_at_unix_millis, record.last_updated_at_unix_millis);

        let loaded = store.get_stream(record.id).await.expect("get");
        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn interrupt_is_a_conditional_update() {
        let store = open_memory_store().await;
        store
            .insert_stream(new_stream("m1", "u1"))
            .await
            .expect("insert");
        let message_id = MessageId::parse("m1").expect("message id");

        let first = store
            .interrupt_streaming(message_id.clone())
            .await
            .expect("first interrupt");
        let second = store
            .interrupt_streaming(message_id)
            .await
            .expect("second interrupt");
        let missing = store
            .interrupt_streaming(MessageId::parse("missing-id").expect("message id"))
            .await
            .expect("missing interrupt");

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(missing, 0);
    }

    #[tokio::test]
    async fn transition_applies_only_from_expected_status() {
        let store = open_memory_store().await;
        let record = store
            .insert_stream(new_stream("m1", "u1"))
            .await
            .expect("insert");

        let resumed_early = store
            .transition_stream(
                record.id,
                StatusTransition::single(StreamStatus::Paused, StreamStatus::Resumed),
            )
            .await
            .expect("transition");
        assert!(!resumed_early);

        store
            .interrupt_streaming(record.message_id.clone())
            .await
            .expect("interrupt");

        let first = store
            .transition_stream(
                record.id,
                StatusTransition::single(StreamStatus::Paused, StreamStatus::Resumed),
            )
            .await
            .expect("first resume");
        let second = store
            .transition_stream(
                record.id,
                StatusTransition::single(StreamStatus::Paused, StreamStatus::Resumed),
            )
            .await
            .expect("second resume");

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_before_touching_the_table() {
        let store = open_memory_store().await;
        let record = store
            .insert_stream(new_stream("m1", "u1"))
            .await
            .expect("insert");

        let error = store
            .transition_stream(
                record.id,
                StatusTransition::single(StreamStatus::Completed, StreamStatus::Streaming),
            )
            .await
            .expect_err("completed is terminal");
        assert!(matches!(
            error,
            crate::StorageError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn paused_listing_is_scoped_to_user_and_newest_first() {
        let store = open_memory_store().await;
        let older = store
            .insert_stream(new_stream("m1", "u1"))
            .await
            .expect("insert older");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = store
            .insert_stream(new_stream("m2", "u1"))
            .await
            .expect("insert newer");
        store
            .insert_stream(new_stream("m3", "u2"))
            .await
            .expect("insert other user");

        for message in ["m1", "m2", "m3"] {
            store
                .interrupt_streaming(MessageId::parse(message).expect("message id"))
                .await
                .expect("interrupt");
        }

        let paused = store
            .list_streams_by_status(UserId::parse("u1").expect("user"), StreamStatus::Paused)
            .await
            .expect("list");
        let ids = paused.iter().map(|record| record.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_records() {
        let store = open_memory_store().await;
        let done = store
            .insert_stream(new_stream("m1", "u1"))
            .await
            .expect("insert done");
        let live = store
            .insert_stream(new_stream("m2", "u1"))
            .await
            .expect("insert live");
        store
            .transition_stream(
                done.id,
                StatusTransition::single(StreamStatus::Streaming, StreamStatus::Completed),
            )
            .await
            .expect("complete");

        let purged = store
            .purge_terminal_streams(unix_timestamp_millis() + 1_000)
            .await
            .expect("purge");

        assert_eq!(purged, 1);
        assert!(store.get_stream(done.id).await.expect("get").is_none());
        assert!(store.get_stream(live.id).await.expect("get").is_some());
    }
}
