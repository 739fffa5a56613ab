pub mod auth;
pub mod error;
pub mod generation;
pub mod lifecycle;
pub mod relay;
pub mod routes;
pub mod settings;
pub mod sweeper;

use std::sync::Arc;

use threadline_storage::StreamRecordStore;

pub use auth::{HeaderUserResolver, UserResolver};
pub use error::{ApiError, ApiResult};
pub use generation::{
    EchoGeneration, GenerationError, GenerationEvent, GenerationHandle, GenerationRequest,
    GenerationService,
};
pub use lifecycle::{LifecycleError, LifecycleResult, StreamLifecycle};
pub use relay::{RelayFrame, RelaySubscription, StreamRelay};
pub use routes::router;
pub use settings::{ServerSettings, SettingsError, SettingsStore};
pub use sweeper::{RetentionSweeper, SweepReport};

/// Shared handles behind every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: StreamLifecycle,
    pub relay: Arc<StreamRelay>,
    pub generation: Arc<dyn GenerationService>,
    pub users: Arc<dyn UserResolver>,
    pub settings: Arc<SettingsStore>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StreamRecordStore>,
        generation: Arc<dyn GenerationService>,
        users: Arc<dyn UserResolver>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            lifecycle: StreamLifecycle::new(store),
            relay: Arc::new(StreamRelay::new()),
            generation,
            users,
            settings,
        }
    }
}
