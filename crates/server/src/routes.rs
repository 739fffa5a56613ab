use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use snafu::{OptionExt, ResultExt};
use threadline_storage::{MessageId, StorageResult, StreamId, StreamRecord, ThreadId, UserId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::error::{
    ApiResult, ForbiddenSnafu, GenerationSnafu, NotFoundSnafu, UnauthenticatedSnafu,
    ValidationSnafu,
};
use crate::generation::{GenerationEvent, GenerationEvents, GenerationRequest};
use crate::lifecycle::StreamLifecycle;
use crate::relay::{RelayFrame, RelaySubscription, StreamRelay};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/streams", post(start_stream))
        .route("/api/streams/interrupt", post(mark_interrupted))
        .route("/api/streams/resumable", get(list_resumable))
        .route("/api/streams/{stream_id}/resume", post(resume_stream))
        .route("/api/streams/{stream_id}/cancel", post(cancel_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStreamBody {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InterruptBody {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InterruptResponse {
    success: bool,
    updated: u64,
    message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResumableStream {
    stream_id: String,
    thread_id: String,
    message_id: String,
    /// Unix milliseconds.
    started_at: i64,
}

impl From<StreamRecord> for ResumableStream {
    fn from(record: StreamRecord) -> Self {
        Self {
            stream_id: record.id.to_string(),
            thread_id: record.thread_id.into_inner(),
            message_id: record.message_id.into_inner(),
            started_at: record.started_at_unix_millis,
        }
    }
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    success: bool,
    cancelled: bool,
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn start_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let user_id = require_user(&state, &headers, "start-stream-auth")?;
    let request: StartStreamBody = parse_body(&body, "start-stream-body")?;
    let thread_id = required_field(
        request.thread_id,
        "threadId",
        "start-stream-thread-id",
        ThreadId::parse,
    )?;
    let message_id = required_field(
        request.message_id,
        "messageId",
        "start-stream-message-id",
        MessageId::parse,
    )?;

    let record = state.lifecycle.begin(thread_id, message_id, user_id).await?;
    let subscription = launch_generation(&state, &record, request.prompt).await?;

    let mut lead = vec![sse_event(
        "stream",
        json!({
            "streamId": record.id.to_string(),
            "messageId": record.message_id.as_str(),
        }),
    )];
    lead.extend(subscription.replay.iter().map(frame_event));
    Ok(sse_response(state.relay.clone(), record.id, lead, subscription))
}

/// Body is parsed regardless of content type so beacon-style `text/plain`
/// posts from a closing page are accepted.
async fn mark_interrupted(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<InterruptResponse>> {
    require_user(&state, &headers, "interrupt-auth")?;
    let request: InterruptBody = parse_body(&body, "interrupt-body")?;
    let message_id = required_field(
        request.message_id,
        "messageId",
        "interrupt-message-id",
        MessageId::parse,
    )?;

    let updated = state.lifecycle.mark_interrupted(&message_id).await?;
    Ok(Json(InterruptResponse {
        success: true,
        updated,
        message_id: message_id.into_inner(),
    }))
}

async fn list_resumable(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ResumableStream>>> {
    let user_id = require_user(&state, &headers, "list-resumable-auth")?;
    let records = state.lifecycle.list_resumable(&user_id).await?;
    Ok(Json(records.into_iter().map(ResumableStream::from).collect()))
}

async fn resume_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_stream_id): Path<String>,
) -> ApiResult<Response> {
    let user_id = require_user(&state, &headers, "resume-auth")?;
    let stream_id = parse_stream_id(&raw_stream_id, "resume-stream-id")?;
    let record = owned_record(&state, stream_id, &user_id, "resume-ownership").await?;
    state.lifecycle.resume(stream_id).await?;

    let subscription = match state.relay.subscribe(stream_id).await {
        Some(subscription)
            if subscription.is_finished()
                && subscription.replay.last() == Some(&RelayFrame::Done) =>
        {
            // Output finished while nobody was attached; hand it over and close the record.
            state.lifecycle.complete(stream_id).await?;
            subscription
        }
        Some(subscription) if !subscription.is_finished() => {
            state.lifecycle.restart(stream_id).await?;
            subscription
        }
        _ => {
            tracing::info!(
                stream_id = %stream_id,
                message_id = %record.message_id,
                "no replay buffer for stream, re-issuing generation"
            );
            state.lifecycle.restart(stream_id).await?;
            launch_generation(&state, &record, None).await?
        }
    };

    let mut lead = vec![sse_event(
        "replay",
        json!({
            "streamId": stream_id.to_string(),
            "messageId": record.message_id.as_str(),
            "text": subscription.replayed_text(),
        }),
    )];
    if let Some(terminal) = subscription.replay.last().filter(|frame| frame.is_terminal()) {
        lead.push(frame_event(terminal));
    }
    Ok(sse_response(state.relay.clone(), stream_id, lead, subscription))
}

async fn cancel_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_stream_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let user_id = require_user(&state, &headers, "cancel-auth")?;
    let stream_id = parse_stream_id(&raw_stream_id, "cancel-stream-id")?;
    owned_record(&state, stream_id, &user_id, "cancel-ownership").await?;

    let cancelled = state.lifecycle.cancel(stream_id).await?;
    let stopped = state.relay.stop(stream_id).await;
    tracing::debug!(stream_id = %stream_id, cancelled, stopped, "cancel requested");

    Ok(Json(CancelResponse {
        success: true,
        cancelled,
    }))
}

/// Starts generation for `record` and wires its output into the relay. The returned
/// subscription is taken before any output can be produced.
async fn launch_generation(
    state: &AppState,
    record: &StreamRecord,
    prompt: Option<String>,
) -> ApiResult<RelaySubscription> {
    let request = GenerationRequest {
        stream_id: record.id,
        thread_id: record.thread_id.clone(),
        message_id: record.message_id.clone(),
        prompt,
    };
    let handle = match state.generation.generate(request) {
        Ok(handle) => handle,
        Err(source) => {
            // Leave the record resumable instead of stuck in `streaming`.
            if let Err(error) = state.lifecycle.pause(record.id).await {
                tracing::warn!(stream_id = %record.id, error = %error, "failed to pause stream");
            }
            return Err(source).context(GenerationSnafu {
                stage: "launch-generation",
            });
        }
    };

    let capacity = state.settings.settings().relay.channel_capacity;
    let stop_rx = state.relay.register(record.id, capacity).await;
    let subscription = state
        .relay
        .subscribe(record.id)
        .await
        .context(NotFoundSnafu {
            stage: "launch-generation-subscribe",
            stream_id: record.id,
        })?;

    tokio::spawn(handle.worker);
    tokio::spawn(pump_generation(
        state.lifecycle.clone(),
        state.relay.clone(),
        record.id,
        handle.events,
        stop_rx,
    ));
    Ok(subscription)
}

async fn pump_generation(
    lifecycle: StreamLifecycle,
    relay: Arc<StreamRelay>,
    stream_id: StreamId,
    mut events: GenerationEvents,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            stopped = &mut stop_rx => {
                events.cancel();
                // An error here means the buffer was replaced, so it is not ours to close.
                if stopped.is_ok() {
                    relay
                        .publish(stream_id, RelayFrame::Failed("stream cancelled".to_string()))
                        .await;
                }
                tracing::debug!(stream_id = %stream_id, "generation pump stopped");
                return;
            }
            event = events.recv() => match event {
                Some(GenerationEvent::Delta(text)) => {
                    relay.publish(stream_id, RelayFrame::Delta(text)).await;
                }
                Some(GenerationEvent::Done) => {
                    relay.publish(stream_id, RelayFrame::Done).await;
                    if let Err(error) = lifecycle.complete(stream_id).await {
                        tracing::warn!(
                            stream_id = %stream_id,
                            error = %error,
                            "failed to complete stream"
                        );
                    }
                    return;
                }
                failure => {
                    let message = match failure {
                        Some(GenerationEvent::Error(message)) => message,
                        _ => "generation ended without completing".to_string(),
                    };
                    tracing::warn!(stream_id = %stream_id, error = %message, "generation failed");
                    relay.publish(stream_id, RelayFrame::Failed(message)).await;
                    if let Err(error) = lifecycle.pause(stream_id).await {
                        tracing::warn!(
                            stream_id = %stream_id,
                            error = %error,
                            "failed to pause stream"
                        );
                    }
                    return;
                }
            }
        }
    }
}

/// `lead` must already cover every frame in `subscription.replay`.
fn sse_response(
    relay: Arc<StreamRelay>,
    stream_id: StreamId,
    lead: Vec<Event>,
    subscription: RelaySubscription,
) -> Response {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    for event in lead {
        let _ = event_tx.send(Ok(event));
    }

    if let Some(live) = subscription.live {
        let delivered = subscription.replay.len();
        tokio::spawn(forward_live(relay, stream_id, live, delivered, event_tx));
    }

    Sse::new(UnboundedReceiverStream::new(event_rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Forwards live frames to one SSE client. `delivered` counts the buffered frames the
/// client already has; a lagging receiver is rebuilt from the replay buffer at that
/// position, so no frame is skipped.
async fn forward_live(
    relay: Arc<StreamRelay>,
    stream_id: StreamId,
    mut live: broadcast::Receiver<RelayFrame>,
    mut delivered: usize,
    events: mpsc::UnboundedSender<Result<Event, Infallible>>,
) {
    loop {
        let frame = match live.recv().await {
            Ok(frame) => frame,
            Err(RecvError::Closed) => return,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(
                    stream_id = %stream_id,
                    skipped,
                    "sse subscriber lagged, catching up from the replay buffer"
                );
                let Some(catch_up) = relay
                    .subscribe(stream_id)
                    .await
                    .filter(|catch_up| catch_up.replay.len() >= delivered)
                else {
                    tracing::warn!(stream_id = %stream_id, "replay buffer lost while catching up");
                    let lost = RelayFrame::Failed("stream output was lost".to_string());
                    let _ = events.send(Ok(frame_event(&lost)));
                    return;
                };

                for frame in &catch_up.replay[delivered..] {
                    if events.send(Ok(frame_event(frame))).is_err() || frame.is_terminal() {
                        return;
                    }
                }
                delivered = catch_up.replay.len();
                match catch_up.live {
                    Some(next) => {
                        live = next;
                        continue;
                    }
                    None => return,
                }
            }
        };

        delivered += 1;
        let terminal = frame.is_terminal();
        if events.send(Ok(frame_event(&frame))).is_err() || terminal {
            return;
        }
    }
}

fn frame_event(frame: &RelayFrame) -> Event {
    match frame {
        RelayFrame::Delta(text) => sse_event("delta", json!({ "text": text })),
        RelayFrame::Done => sse_event("done", json!({})),
        RelayFrame::Failed(message) => sse_event("error", json!({ "message": message })),
    }
}

fn sse_event(name: &'static str, payload: serde_json::Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

fn require_user(state: &AppState, headers: &HeaderMap, stage: &'static str) -> ApiResult<UserId> {
    state
        .users
        .resolve(headers)
        .context(UnauthenticatedSnafu { stage })
}

async fn owned_record(
    state: &AppState,
    stream_id: StreamId,
    user_id: &UserId,
    stage: &'static str,
) -> ApiResult<StreamRecord> {
    let record = state.lifecycle.get(stream_id).await?;
    if &record.user_id != user_id {
        return ForbiddenSnafu { stage, stream_id }.fail();
    }
    Ok(record)
}

fn parse_body<T: DeserializeOwned>(body: &Bytes, stage: &'static str) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return ValidationSnafu {
            stage,
            details: "request body is required",
        }
        .fail();
    }

    serde_json::from_slice(body).map_err(|error| {
        ValidationSnafu {
            stage,
            details: format!("request body is not valid JSON: {error}"),
        }
        .build()
    })
}

fn required_field<T>(
    raw: Option<String>,
    field: &'static str,
    stage: &'static str,
    parse: impl FnOnce(&str) -> StorageResult<T>,
) -> ApiResult<T> {
    parse(raw.as_deref().unwrap_or_default()).map_err(|_| {
        ValidationSnafu {
            stage,
            details: format!("{field} is required"),
        }
        .build()
    })
}

fn parse_stream_id(raw: &str, stage: &'static str) -> ApiResult<StreamId> {
    StreamId::parse(raw).map_err(|_| {
        ValidationSnafu {
            stage,
            details: format!("'{raw}' is not a valid stream id"),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use threadline_storage::{MemoryStreamStore, StreamStatus};
    use tower::ServiceExt;

    use super::*;
    use crate::auth::{DEFAULT_USER_HEADER, HeaderUserResolver};
    use crate::generation::EchoGeneration;
    use crate::settings::{ServerSettings, SettingsStore};

    fn state() -> AppState {
        AppState::new(
            Arc::new(MemoryStreamStore::new()),
            Arc::new(EchoGeneration::new(Duration::ZERO)),
            Arc::new(HeaderUserResolver::default()),
            Arc::new(SettingsStore::new(
                ServerSettings::default(),
                PathBuf::from("unused.json"),
            )),
        )
    }

    fn post(uri: &str, user: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header(DEFAULT_USER_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    fn get_as(uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(user) = user {
            builder = builder.header(DEFAULT_USER_HEADER, user);
        }
        builder.body(Body::empty()).expect("request")
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).expect("json body")
    }

    async fn paused_stream(state: &AppState, message: &str, user: &str) -> StreamRecord {
        let message_id = MessageId::parse(message).expect("message id");
        let record = state
            .lifecycle
            .start(
                ThreadId::parse("t1").expect("thread id"),
                message_id.clone(),
                UserId::parse(user).expect("user id"),
            )
            .await
            .expect("start");
        state
            .lifecycle
            .mark_interrupted(&message_id)
            .await
            .expect("interrupt");
        record
    }

    async fn wait_for_status(state: &AppState, stream_id: StreamId, expected: StreamStatus) {
        for _ in 0..100 {
            let record = state.lifecycle.get(stream_id).await.expect("get");
            if record.status == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream {stream_id} never reached {expected}");
    }

    #[tokio::test]
    async fn interrupt_without_body_is_a_validation_error() {
        let response = router(state())
            .oneshot(post("/api/streams/interrupt", Some("u1"), ""))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "validation");
    }

    #[tokio::test]
    async fn interrupt_with_malformed_body_or_blank_id_is_rejected() {
        let app = router(state());
        for body in ["{not json", r#"{"messageId": "   "}"#, r#"{"messageId": 7}"#, "{}"] {
            let response = app
                .clone()
                .oneshot(post("/api/streams/interrupt", Some("u1"), body))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn interrupt_of_unknown_message_succeeds_with_zero_updates() {
        let response = router(state())
            .oneshot(post(
                "/api/streams/interrupt",
                Some("u1"),
                r#"{"messageId":"missing-id"}"#,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "success": true, "updated": 0, "messageId": "missing-id" })
        );
    }

    #[tokio::test]
    async fn interrupt_accepts_text_plain_beacon_bodies() {
        let state = state();
        state
            .lifecycle
            .start(
                ThreadId::parse("t1").expect("thread id"),
                MessageId::parse("m1").expect("message id"),
                UserId::parse("u1").expect("user id"),
            )
            .await
            .expect("start");

        let request = Request::builder()
            .method("POST")
            .uri("/api/streams/interrupt")
            .header(header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .header(DEFAULT_USER_HEADER, "u1")
            .body(Body::from(r#"{"messageId":"m1"}"#))
            .expect("request");
        let response = router(state).oneshot(request).await.expect("response");

        assert_eq!(body_json(response).await["updated"], 1);
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_rejected() {
        let response = router(state())
            .oneshot(get_as("/api/streams/resumable", None))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn resumable_list_is_scoped_and_newest_first() {
        let state = state();
        let older = paused_stream(&state, "m1", "u1").await;
        tokio::time::sleep(Duration::from_millis(3)).await;
        let newer = paused_stream(&state, "m2", "u1").await;
        paused_stream(&state, "m3", "u2").await;

        let response = router(state)
            .oneshot(get_as("/api/streams/resumable", Some("u1")))
            .await
            .expect("response");
        let listed = body_json(response).await;

        assert_eq!(listed.as_array().map(Vec::len), Some(2));
        assert_eq!(listed[0]["streamId"], newer.id.to_string());
        assert_eq!(listed[0]["threadId"], "t1");
        assert_eq!(listed[0]["messageId"], "m2");
        assert_eq!(listed[0]["startedAt"], newer.started_at_unix_millis);
        assert_eq!(listed[1]["streamId"], older.id.to_string());
    }

    #[tokio::test]
    async fn resume_of_foreign_stream_is_forbidden() {
        let state = state();
        let record = paused_stream(&state, "m1", "u2").await;

        let response = router(state.clone())
            .oneshot(post(&format!("/api/streams/{}/resume", record.id), Some("u1"), ""))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            state.lifecycle.get(record.id).await.expect("get").status,
            StreamStatus::Paused
        );
    }

    #[tokio::test]
    async fn resume_of_active_stream_conflicts() {
        let state = state();
        let record = state
            .lifecycle
            .start(
                ThreadId::parse("t1").expect("thread id"),
                MessageId::parse("m1").expect("message id"),
                UserId::parse("u1").expect("user id"),
            )
            .await
            .expect("start");

        let response = router(state)
            .oneshot(post(&format!("/api/streams/{}/resume", record.id), Some("u1"), ""))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "not_resumable");
    }

    #[tokio::test]
    async fn resume_with_invalid_or_unknown_id_is_rejected() {
        let app = router(state());
        let invalid = app
            .clone()
            .oneshot(post("/api/streams/not-a-uuid/resume", Some("u1"), ""))
            .await
            .expect("response");
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let unknown = app
            .oneshot(post(
                &format!("/api/streams/{}/resume", StreamId::new_v7()),
                Some("u1"),
                "",
            ))
            .await
            .expect("response");
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_streams_output_and_completes_the_record() {
        let state = state();
        let response = router(state.clone())
            .oneshot(post(
                "/api/streams",
                Some("u1"),
                r#"{"threadId":"t1","messageId":"m1","prompt":"hello there"}"#,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        assert!(body.contains("event: stream"), "{body}");
        assert!(body.contains(r#"{"text":"hello "}"#), "{body}");
        assert!(body.contains("event: done"), "{body}");

        let message_id = MessageId::parse("m1").expect("message id");
        let history = state.lifecycle.history(&message_id).await.expect("history");
        assert_eq!(history.len(), 1);
        wait_for_status(&state, history[0].id, StreamStatus::Completed).await;
    }

    #[tokio::test]
    async fn resume_without_buffer_reissues_generation() {
        let state = state();
        let record = paused_stream(&state, "m1", "u1").await;

        let response = router(state.clone())
            .oneshot(post(&format!("/api/streams/{}/resume", record.id), Some("u1"), ""))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        let replay_at = body.find("event: replay").expect("replay event");
        let done_at = body.find("event: done").expect("done event");
        assert!(replay_at < done_at);
        wait_for_status(&state, record.id, StreamStatus::Completed).await;
    }

    #[tokio::test]
    async fn resume_replays_output_finished_while_detached() {
        let state = state();
        let record = paused_stream(&state, "m1", "u1").await;
        let _stop_rx = state.relay.register(record.id, 8).await;
        state
            .relay
            .publish(record.id, RelayFrame::Delta("kept output".to_string()))
            .await;
        state.relay.publish(record.id, RelayFrame::Done).await;

        let response = router(state.clone())
            .oneshot(post(&format!("/api/streams/{}/resume", record.id), Some("u1"), ""))
            .await
            .expect("response");

        let body = body_text(response).await;
        assert!(body.contains("kept output"), "{body}");
        assert!(body.contains("event: done"), "{body}");
        assert_eq!(
            state.lifecycle.get(record.id).await.expect("get").status,
            StreamStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancel_marks_record_cancelled() {
        let state = state();
        let record = paused_stream(&state, "m1", "u1").await;

        let response = router(state.clone())
            .oneshot(post(&format!("/api/streams/{}/cancel", record.id), Some("u1"), ""))
            .await
            .expect("response");

        assert_eq!(
            body_json(response).await,
            json!({ "success": true, "cancelled": true })
        );
        assert_eq!(
            state.lifecycle.get(record.id).await.expect("get").status,
            StreamStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn lagging_sse_client_catches_up_from_the_replay_buffer() {
        let relay = Arc::new(StreamRelay::new());
        let stream_id = StreamId::new_v7();
        let _stop_rx = relay.register(stream_id, 2).await;
        let subscription = relay.subscribe(stream_id).await.expect("subscription");
        let response = sse_response(relay.clone(), stream_id, Vec::new(), subscription);

        let words = ["a", "b", "c", "d", "e"];
        for word in words {
            relay
                .publish(stream_id, RelayFrame::Delta(word.to_string()))
                .await;
        }
        relay.publish(stream_id, RelayFrame::Done).await;

        let body = body_text(response).await;
        for word in words {
            assert!(
                body.contains(&format!(r#"{{"text":"{word}"}}"#)),
                "missing {word} in {body}"
            );
        }
        assert_eq!(body.matches("event: delta").count(), words.len());
        assert_eq!(body.matches("event: done").count(), 1);
        assert!(!body.contains("event: error"));
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let response = router(state())
            .oneshot(get_as("/healthz", None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
