use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use threadline_server::{
    AppState, EchoGeneration, HeaderUserResolver, RetentionSweeper, SettingsError, SettingsStore,
    router,
};
use threadline_storage::{SqliteStreamStore, StorageError};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Snafu)]
enum ServerError {
    #[snafu(display("failed to load settings: {source}"))]
    LoadSettings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to open stream store at '{path}': {source}"))]
    OpenStore {
        stage: &'static str,
        path: String,
        source: StorageError,
    },
    #[snafu(display("failed to bind '{address}': {source}"))]
    Bind {
        stage: &'static str,
        address: String,
        source: std::io::Error,
    },
    #[snafu(display("http server failed: {source}"))]
    Serve {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Server entry point.
///
/// 1. Tracing with `RUST_LOG` (defaults to `info`)
/// 2. Settings from defaults, the JSON file and `THREADLINE_*` variables
/// 3. SQLite stream store with migrations applied
/// 4. Retention sweeper and the HTTP router, both stopped on Ctrl-C
/// 5. On unix, SIGHUP re-reads the settings file
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "server exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let settings = Arc::new(SettingsStore::load().context(LoadSettingsSnafu {
        stage: "load-settings",
    })?);
    let current = settings.settings();
    tracing::info!(config_path = ?settings.config_path(), "settings loaded");

    let store = SqliteStreamStore::open(&current.database_path)
        .await
        .context(OpenStoreSnafu {
            stage: "open-stream-store",
            path: current.database_path.clone(),
        })?;
    tracing::info!(database_url = store.database_url(), "stream store ready");

    let state = AppState::new(
        Arc::new(store),
        Arc::new(EchoGeneration::new(current.generation.echo_delay())),
        Arc::new(HeaderUserResolver::from_name(&current.auth.user_header)),
        settings.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    #[cfg(unix)]
    spawn_reload_on_hangup(settings.clone(), shutdown_rx.clone());
    let sweeper = RetentionSweeper::new(state.lifecycle.clone(), state.relay.clone(), settings)
        .spawn(shutdown_rx);

    let listener = tokio::net::TcpListener::bind(&current.bind_address)
        .await
        .context(BindSnafu {
            stage: "bind-listener",
            address: current.bind_address.clone(),
        })?;
    tracing::info!(address = %current.bind_address, "listening");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(ServeSnafu {
            stage: "serve-http",
        });

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), sweeper).await.is_err() {
        tracing::warn!("retention sweeper did not stop in time");
    }

    served
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(unix)]
fn spawn_reload_on_hangup(settings: Arc<SettingsStore>, mut shutdown: watch::Receiver<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(error) => {
            tracing::warn!(error = %error, "failed to listen for SIGHUP, settings reload disabled");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                    if let Err(error) = settings.reload() {
                        tracing::warn!(error = %error, "settings reload failed, keeping previous");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}
