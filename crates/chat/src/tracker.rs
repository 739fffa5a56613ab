use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;

use crate::message::MessageId;

pub const DEFAULT_USER_HEADER: &str = "x-user-id";
const INTERRUPT_PATH: &str = "/api/streams/interrupt";

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum NotifyError {
    #[snafu(display("interrupt request for {message_id} failed: {source}"))]
    Request {
        stage: &'static str,
        message_id: MessageId,
        source: reqwest::Error,
    },
    #[snafu(display("interrupt for {message_id} was rejected with {status}: {body}"))]
    Status {
        stage: &'static str,
        message_id: MessageId,
        status: u16,
        body: String,
    },
    #[snafu(display("interrupt for {message_id} timed out after {timeout:?}"))]
    Timeout {
        stage: &'static str,
        message_id: MessageId,
        timeout: Duration,
    },
}

/// Server acknowledgement of an interrupt notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptAck {
    pub success: bool,
    #[serde(default)]
    pub updated: u64,
}

/// Delivers `markInterrupted` for one message. Delivery is best effort.
pub trait InterruptNotifier: Send + Sync {
    fn notify_interrupted<'a>(
        &'a self,
        message_id: &'a MessageId,
    ) -> BoxFuture<'a, NotifyResult<InterruptAck>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InterruptRequest<'a> {
    message_id: &'a MessageId,
}

/// Posts `{messageId}` to the server's interrupt route.
#[derive(Debug, Clone)]
pub struct HttpInterruptNotifier {
    client: reqwest::Client,
    endpoint: String,
    user_header: String,
    user_id: String,
}

impl HttpInterruptNotifier {
    pub fn new(base_url: &str, user_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}{INTERRUPT_PATH}", base_url.trim_end_matches('/')),
            user_header: DEFAULT_USER_HEADER.to_string(),
            user_id: user_id.into(),
        }
    }

    pub fn with_user_header(mut self, header: impl Into<String>) -> Self {
        self.user_header = header.into();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl InterruptNotifier for HttpInterruptNotifier {
    fn notify_interrupted<'a>(
        &'a self,
        message_id: &'a MessageId,
    ) -> BoxFuture<'a, NotifyResult<InterruptAck>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .header(self.user_header.as_str(), self.user_id.as_str())
                .json(&InterruptRequest { message_id })
                .send()
                .await
                .context(RequestSnafu {
                    stage: "send-interrupt",
                    message_id: message_id.clone(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return StatusSnafu {
                    stage: "check-interrupt-status",
                    message_id: message_id.clone(),
                    status: status.as_u16(),
                    body,
                }
                .fail();
            }

            response.json::<InterruptAck>().await.context(RequestSnafu {
                stage: "decode-interrupt-ack",
                message_id: message_id.clone(),
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    /// Upper bound for the whole teardown notification batch.
    pub teardown_budget: Duration,
    pub per_request_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            teardown_budget: Duration::from_secs(2),
            per_request_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub acknowledged: Vec<MessageId>,
    pub failed: Vec<MessageId>,
    pub updated: u64,
    pub budget_exhausted: bool,
}

/// Message ids this client believes are still streaming.
///
/// The set lives behind an `Arc` so it outlives the view state that created it, and
/// teardown drains it into interrupt notifications.
#[derive(Clone)]
pub struct ClientStreamTracker {
    active: Arc<Mutex<HashSet<MessageId>>>,
    notifier: Arc<dyn InterruptNotifier>,
    settings: TrackerSettings,
}

impl ClientStreamTracker {
    pub fn new(notifier: Arc<dyn InterruptNotifier>) -> Self {
        Self::with_settings(notifier, TrackerSettings::default())
    }

    pub fn with_settings(notifier: Arc<dyn InterruptNotifier>, settings: TrackerSettings) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> TrackerSettings {
        self.settings
    }

    /// Returns false when the message was already tracked.
    pub fn track(&self, message_id: MessageId) -> bool {
        tracing::debug!(message_id = %message_id, "tracking active stream");
        self.lock().insert(message_id)
    }

    pub fn untrack(&self, message_id: &MessageId) -> bool {
        self.lock().remove(message_id)
    }

    pub fn is_tracked(&self, message_id: &MessageId) -> bool {
        self.lock().contains(message_id)
    }

    /// Tracked ids in sorted order.
    pub fn active(&self) -> Vec<MessageId> {
        let mut active = self.lock().iter().cloned().collect::<Vec<_>>();
        active.sort();
        active
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drains the tracked set and notifies the server for each id, bounded by the
    /// per-request timeout and the overall teardown budget.
    pub async fn notify_all(&self) -> TeardownReport {
        let drained = self.drain();
        let mut report = TeardownReport::default();
        if drained.is_empty() {
            return report;
        }

        let per_request = self.settings.per_request_timeout;
        let deliveries = drained.iter().map(|message_id| {
            let notifier = self.notifier.clone();
            async move {
                let outcome =
                    match tokio::time::timeout(per_request, notifier.notify_interrupted(message_id))
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => TimeoutSnafu {
                            stage: "notify-interrupt",
                            message_id: message_id.clone(),
                            timeout: per_request,
                        }
                        .fail(),
                    };
                (message_id.clone(), outcome)
            }
        });

        let Ok(outcomes) =
            tokio::time::timeout(self.settings.teardown_budget, join_all(deliveries)).await
        else {
            tracing::warn!(
                pending = drained.len(),
                budget = ?self.settings.teardown_budget,
                "teardown budget exhausted before all interrupts were delivered"
            );
            report.failed = drained.clone();
            report.budget_exhausted = true;
            return report;
        };

        for (message_id, outcome) in outcomes {
            match outcome {
                Ok(ack) => {
                    tracing::debug!(
                        message_id = %message_id,
                        updated_count = ack.updated,
                        "interrupt delivered"
                    );
                    report.updated += ack.updated;
                    report.acknowledged.push(message_id);
                }
                Err(error) => {
                    tracing::warn!(
                        message_id = %message_id,
                        error = %error,
                        "interrupt delivery failed"
                    );
                    report.failed.push(message_id);
                }
            }
        }
        report
    }

    /// Fire-and-forget teardown: spawns [`ClientStreamTracker::notify_all`] on the
    /// current runtime. Returns `None` without touching the set when no runtime is
    /// available.
    pub fn teardown(&self) -> Option<JoinHandle<TeardownReport>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                tracked = self.len(),
                "no async runtime available for teardown notifications"
            );
            return None;
        };

        let tracker = self.clone();
        Some(runtime.spawn(async move { tracker.notify_all().await }))
    }

    fn drain(&self) -> Vec<MessageId> {
        let mut drained = self.lock().drain().collect::<Vec<_>>();
        drained.sort();
        drained
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<MessageId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Triggers the tracker's teardown when dropped, unless disarmed.
pub struct TeardownGuard {
    tracker: ClientStreamTracker,
    armed: bool,
}

impl TeardownGuard {
    pub fn new(tracker: ClientStreamTracker) -> Self {
        Self {
            tracker,
            armed: true,
        }
    }

    pub fn tracker(&self) -> &ClientStreamTracker {
        &self.tracker
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.armed && !self.tracker.is_empty() {
            let _ = self.tracker.teardown();
        }
    }
}
