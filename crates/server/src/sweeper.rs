use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::lifecycle::{LifecycleResult, StreamLifecycle};
use crate::relay::StreamRelay;
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged_records: u64,
    pub evicted_buffers: usize,
    /// Replay buffers still held after eviction.
    pub retained_buffers: usize,
}

impl SweepReport {
    pub fn removed_anything(&self) -> bool {
        self.purged_records > 0 || self.evicted_buffers > 0
    }
}

/// Periodically deletes old terminal records and drops finished replay buffers.
/// Intervals are read from the live settings on every round.
pub struct RetentionSweeper {
    lifecycle: StreamLifecycle,
    relay: Arc<StreamRelay>,
    settings: Arc<SettingsStore>,
}

impl RetentionSweeper {
    pub fn new(
        lifecycle: StreamLifecycle,
        relay: Arc<StreamRelay>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            lifecycle,
            relay,
            settings,
        }
    }

    pub async fn sweep_once(&self) -> LifecycleResult<SweepReport> {
        let settings = self.settings.settings();
        let evicted_buffers = self
            .relay
            .evict_finished(settings.relay.replay_retention())
            .await;
        let purged_records = self
            .lifecycle
            .purge_terminal(settings.retention.terminal_retention())
            .await?;

        Ok(SweepReport {
            purged_records,
            evicted_buffers,
            retained_buffers: self.relay.len().await,
        })
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = self.settings.settings().retention.sweep_interval();
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("retention sweeper stopped");
                            return;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        match self.sweep_once().await {
                            Ok(report) if report.removed_anything() => {
                                tracing::info!(
                                    purged_records = report.purged_records,
                                    evicted_buffers = report.evicted_buffers,
                                    retained_buffers = report.retained_buffers,
                                    "retention sweep finished"
                                );
                            }
                            Ok(report) => tracing::debug!(
                                retained_buffers = report.retained_buffers,
                                "retention sweep found nothing to remove"
                            ),
                            Err(error) => {
                                tracing::warn!(error = %error, "retention sweep failed");
                            }
                        }
                    }
                }
            }
        })
    }
}
